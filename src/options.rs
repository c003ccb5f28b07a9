/// Collection tuning options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Bounded size of the in-memory record cache, in records.
    pub cache_capacity: usize,
}

pub const DEFAULT_CACHE_CAPACITY: usize = 65_536;

impl Default for Options {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the record cache capacity.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = Options::default();
        assert_eq!(options.cache_capacity, DEFAULT_CACHE_CAPACITY);
    }

    #[test]
    fn test_options_builder() {
        let options = Options::new().cache_capacity(128);
        assert_eq!(options.cache_capacity, 128);
    }
}
