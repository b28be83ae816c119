//! Runtime configuration

/// Default number of live heap objects that triggers an automatic collection
pub const DEFAULT_GC_THRESHOLD: usize = 1024;

/// Default maximum depth of nested calls
pub const DEFAULT_MAX_CALL_DEPTH: usize = 200;

/// Options for creating a [`State`](crate::State)
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Maximum number of nested calls before `CallDepthExceeded`
    pub max_call_depth: usize,

    /// Initial collection threshold, in live heap objects
    pub gc_threshold: usize,

    /// Collect automatically when the threshold is passed
    pub auto_collect: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            gc_threshold: DEFAULT_GC_THRESHOLD,
            auto_collect: true,
        }
    }
}

impl VmOptions {
    /// Options with automatic collection disabled; collections only happen
    /// through `collect_garbage` and `close`
    pub fn manual_gc() -> Self {
        Self {
            auto_collect: false,
            ..Default::default()
        }
    }

    /// Options with a specific call depth limit
    pub fn with_call_depth(max_call_depth: usize) -> Self {
        Self {
            max_call_depth,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = VmOptions::default();
        assert_eq!(options.max_call_depth, DEFAULT_MAX_CALL_DEPTH);
        assert_eq!(options.gc_threshold, DEFAULT_GC_THRESHOLD);
        assert!(options.auto_collect);
    }

    #[test]
    fn test_manual_gc_options() {
        let options = VmOptions::manual_gc();
        assert!(!options.auto_collect);
        assert_eq!(options.max_call_depth, DEFAULT_MAX_CALL_DEPTH);
    }
}
