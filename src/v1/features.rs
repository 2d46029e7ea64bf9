//! Runtime probing of optional kernel features.

use super::{Config, ControllerKind};

/// Kernel features whose presence depends on the running kernel's build configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Swap accounting in the memory controller (`CONFIG_MEMCG_SWAP`, plus `swapaccount=1` on
    /// kernels where it defaults off). Without it the `memory.memsw.*` files do not exist and
    /// `memsw` limits must not be written.
    MemcgSwap,
}

/// Whether the running kernel exposes the given feature under this configuration's mount.
pub fn has_feature(config: &Config, feature: Feature) -> bool {
    match feature {
        Feature::MemcgSwap => config
            .subsystem_root(ControllerKind::Memory)
            .join("memory.memsw.limit_in_bytes")
            .exists(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memcg_swap_probe() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::with_root(root.path());
        assert!(!has_feature(&config, Feature::MemcgSwap));

        std::fs::create_dir(root.path().join("memory")).unwrap();
        std::fs::write(root.path().join("memory/memory.memsw.limit_in_bytes"), "0\n").unwrap();
        assert!(has_feature(&config, Feature::MemcgSwap));
    }
}
