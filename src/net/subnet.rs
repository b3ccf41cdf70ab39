//! Per-session `/24` subnet allocation (C2).
//!
//! A single mutex serializes `allocate`/`release` so concurrent callers
//! always observe a disjoint set of leases; the allocator never blocks on
//! I/O while the lock is held.

use crate::config::SubnetPool as PoolConfig;
use crate::utils::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use std::sync::Mutex;
use tracing::warn;

/// A leased `/24`, tagged with the pool it came from so release can find it
/// again without re-deriving the pool from the CIDR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetLease {
    pub pool: String,
    pub index: u32,
    pub subnet: Ipv4Net,
    pub allocated_at: DateTime<Utc>,
}

struct PoolState {
    name: String,
    base: Ipv4Net,
    /// `/24` capacity; `used[i]` tracks whether index `i` is leased.
    used: Vec<bool>,
}

pub struct SubnetAllocator {
    pools: Mutex<Vec<PoolState>>,
}

impl SubnetAllocator {
    pub fn new(configs: &[PoolConfig]) -> Result<Self> {
        let mut pools = Vec::with_capacity(configs.len());
        for cfg in configs {
            let base = cfg.parse_base()?;
            let capacity = cfg.capacity()? as usize;
            pools.push(PoolState {
                name: cfg.name.clone(),
                base,
                used: vec![false; capacity],
            });
        }
        Ok(Self {
            pools: Mutex::new(pools),
        })
    }

    fn nth_subnet(base: &Ipv4Net, index: u32) -> Ipv4Net {
        let base_addr = u32::from(base.network());
        let stride = 1u32 << (32 - 24);
        let addr = base_addr.wrapping_add(index.wrapping_mul(stride));
        Ipv4Net::new(std::net::Ipv4Addr::from(addr), 24).expect("derived /24 is always valid")
    }

    /// Walk pools in declared order; within a pool, scan sequentially from
    /// the first unused index.
    pub fn allocate(&self) -> Result<SubnetLease> {
        let mut pools = self.pools.lock().expect("subnet allocator mutex poisoned");
        for pool in pools.iter_mut() {
            if let Some(index) = pool.used.iter().position(|&used| !used) {
                pool.used[index] = true;
                return Ok(SubnetLease {
                    pool: pool.name.clone(),
                    index: index as u32,
                    subnet: Self::nth_subnet(&pool.base, index as u32),
                    allocated_at: Utc::now(),
                });
            }
        }
        Err(CoreError::PoolExhausted)
    }

    /// Idempotent; releasing a lease that is not held is a no-op logged at
    /// warn level.
    pub fn release(&self, lease: &SubnetLease) {
        let mut pools = self.pools.lock().expect("subnet allocator mutex poisoned");
        let Some(pool) = pools.iter_mut().find(|p| p.name == lease.pool) else {
            warn!(pool = %lease.pool, "release of subnet lease from unknown pool");
            return;
        };
        match pool.used.get_mut(lease.index as usize) {
            Some(used) if *used => *used = false,
            Some(_) => warn!(
                pool = %lease.pool,
                index = lease.index,
                "double release of subnet lease"
            ),
            None => warn!(
                pool = %lease.pool,
                index = lease.index,
                "release of subnet lease with out-of-range index"
            ),
        }
    }

    /// Startup reconciliation: mark pool indices used for subnets that
    /// already belong to externally discovered networks (see
    /// `NetworkManager::reconcile`), so the allocator never hands out a
    /// subnet overlapping a network created in a previous process lifetime.
    pub fn reconcile_external(&self, subnets: &[Ipv4Net]) {
        let mut pools = self.pools.lock().expect("subnet allocator mutex poisoned");
        for subnet in subnets {
            for pool in pools.iter_mut() {
                let base_addr = u32::from(pool.base.network());
                let subnet_addr = u32::from(subnet.network());
                let stride = 1u32 << (32 - 24);
                if subnet_addr < base_addr {
                    continue;
                }
                let offset = (subnet_addr - base_addr) / stride;
                if (offset as usize) < pool.used.len()
                    && Self::nth_subnet(&pool.base, offset) == *subnet
                {
                    pool.used[offset as usize] = true;
                }
            }
        }
    }

    /// Total `/24` capacity across all configured pools.
    pub fn total_capacity(&self) -> usize {
        let pools = self.pools.lock().expect("subnet allocator mutex poisoned");
        pools.iter().map(|p| p.used.len()).sum()
    }
}
