// Per-thread command pools
//
// Vulkan command pools are externally synchronized, so each recording thread
// gets its own set (one pool per queue family). The registry is the only
// shared piece and is guarded by a mutex; the pools themselves never leave
// the thread that created them.

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::thread::{self, ThreadId};

/// Command pools owned by the calling thread.
///
/// Deliberately `!Send`: handing a pool to another thread would break the
/// external synchronization rule.
#[derive(Debug, Clone)]
pub struct ThreadCommandPools {
    pools: Vec<(u32, vk::CommandPool)>,
    _not_send: PhantomData<*const ()>,
}

impl ThreadCommandPools {
    /// Pool for a queue family
    pub fn pool(&self, queue_family: u32) -> Option<vk::CommandPool> {
        self.pools
            .iter()
            .find(|(family, _)| *family == queue_family)
            .map(|&(_, pool)| pool)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

/// Thread id -> pools, filled lazily
#[derive(Default)]
pub struct CommandPoolRegistry {
    pools: Mutex<HashMap<ThreadId, Vec<(u32, vk::CommandPool)>>>,
}

impl CommandPoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the calling thread's pools, creating them on first use
    pub fn acquire(&self, device: &ash::Device, families: &[u32]) -> Result<ThreadCommandPools> {
        self.acquire_with(families, |family| {
            let pool_info = vk::CommandPoolCreateInfo::builder()
                .queue_family_index(family)
                // TRANSIENT: Command buffers are short-lived
                // RESET: Frame slots reset their buffers individually
                .flags(
                    vk::CommandPoolCreateFlags::TRANSIENT
                        | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                );

            unsafe {
                device
                    .create_command_pool(&pool_info, None)
                    .context("Failed to create command pool")
            }
        })
    }

    /// Same as `acquire` with the pool constructor supplied by the caller
    pub fn acquire_with<F>(&self, families: &[u32], mut create: F) -> Result<ThreadCommandPools>
    where
        F: FnMut(u32) -> Result<vk::CommandPool>,
    {
        let thread_id = thread::current().id();
        let mut registry = self.pools.lock();

        if let Some(pools) = registry.get(&thread_id) {
            return Ok(ThreadCommandPools {
                pools: pools.clone(),
                _not_send: PhantomData,
            });
        }

        let mut pools = Vec::with_capacity(families.len());
        for &family in families {
            if pools.iter().any(|&(f, _)| f == family) {
                continue;
            }
            pools.push((family, create(family)?));
        }

        log::debug!(
            "Created {} command pool(s) for thread {:?}",
            pools.len(),
            thread_id
        );
        registry.insert(thread_id, pools.clone());

        Ok(ThreadCommandPools {
            pools,
            _not_send: PhantomData,
        })
    }

    /// Number of threads that own pools
    pub fn thread_count(&self) -> usize {
        self.pools.lock().len()
    }

    /// Destroy every pool (and implicitly every buffer allocated from them).
    ///
    /// The device must be idle.
    pub fn destroy_all(&self, device: &ash::Device) {
        let mut registry = self.pools.lock();
        for (_, pools) in registry.drain() {
            for (_, pool) in pools {
                unsafe { device.destroy_command_pool(pool, None) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::sync::Arc;

    fn fake_pool(raw: u64) -> Result<vk::CommandPool> {
        Ok(vk::CommandPool::from_raw(raw))
    }

    #[test]
    fn pools_are_created_once_per_thread() {
        let registry = CommandPoolRegistry::new();
        let mut created = 0;

        let first = registry
            .acquire_with(&[0, 1], |family| {
                created += 1;
                fake_pool(100 + family as u64)
            })
            .unwrap();
        let second = registry
            .acquire_with(&[0, 1], |_| {
                created += 1;
                fake_pool(999)
            })
            .unwrap();

        assert_eq!(created, 2);
        assert_eq!(first.pool(1), second.pool(1));
        assert_eq!(registry.thread_count(), 1);
    }

    #[test]
    fn shared_families_get_one_pool() {
        let registry = CommandPoolRegistry::new();
        let pools = registry.acquire_with(&[0, 0, 2], |f| fake_pool(f as u64 + 1)).unwrap();
        assert_eq!(pools.len(), 2);
        assert_eq!(pools.pool(2), Some(vk::CommandPool::from_raw(3)));
        assert_eq!(pools.pool(1), None);
    }

    #[test]
    fn other_threads_get_their_own_pools() {
        let registry = Arc::new(CommandPoolRegistry::new());
        let main_pool = registry
            .acquire_with(&[0], |_| fake_pool(1))
            .unwrap()
            .pool(0)
            .unwrap()
            .as_raw();

        let worker_registry = Arc::clone(&registry);
        let worker_pool = thread::spawn(move || {
            worker_registry
                .acquire_with(&[0], |_| fake_pool(2))
                .unwrap()
                .pool(0)
                .unwrap()
                .as_raw()
        })
        .join()
        .unwrap();

        assert_ne!(main_pool, worker_pool);
        assert_eq!(registry.thread_count(), 2);
    }
}
