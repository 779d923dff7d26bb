//! Instance selection and load balancing.

use rand::Rng;

use crate::registry::Instance;

/// Result type for selector operations.
pub type Result<T> = std::result::Result<T, SelectorError>;

/// Errors that can occur during selection.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("none available")]
    NoneAvailable,
}

/// Selects an instance from a pool using some strategy.
pub trait Selector: Send + Sync {
    /// Select one instance from the pool.
    fn select<'a>(&self, instances: &'a [Instance]) -> Result<&'a Instance>;

    /// Record the outcome of using an instance, to inform future
    /// selection. The default implementation ignores it.
    fn record(&self, _instance: &Instance, _err: Option<&str>) {}

    /// Name of the strategy.
    fn name(&self) -> &'static str;
}

/// Uniform random selection.
#[derive(Debug, Default)]
pub struct Random;

impl Selector for Random {
    fn select<'a>(&self, instances: &'a [Instance]) -> Result<&'a Instance> {
        // We can't select from an empty pool.
        if instances.is_empty() {
            return Err(SelectorError::NoneAvailable);
        }

        if instances.len() == 1 {
            return Ok(&instances[0]);
        }

        let pick = rand::thread_rng().gen_range(0..instances.len());
        Ok(&instances[pick])
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, address: &str) -> Instance {
        Instance {
            id: id.to_string(),
            address: address.to_string(),
            ..Instance::default()
        }
    }

    #[test]
    fn test_select_empty_pool() {
        let selector = Random;
        assert_eq!(
            selector.select(&[]).unwrap_err(),
            SelectorError::NoneAvailable
        );
    }

    #[test]
    fn test_select_single_instance() {
        let selector = Random;
        let pool = [instance("a", "127.0.0.1:8000")];
        assert_eq!(selector.select(&pool).unwrap().id, "a");
    }

    #[test]
    fn test_select_returns_pool_member() {
        let selector = Random;
        let pool = [
            instance("a", "127.0.0.1:8000"),
            instance("b", "127.0.0.1:8001"),
        ];

        for _ in 0..32 {
            let picked = selector.select(&pool).unwrap();
            assert!(pool.iter().any(|i| i.id == picked.id));
        }
    }

    #[test]
    fn test_select_reaches_every_member() {
        // Regression check: the last pool member must be selectable.
        let selector = Random;
        let pool = [
            instance("a", "127.0.0.1:8000"),
            instance("b", "127.0.0.1:8001"),
        ];

        let mut picked_last = false;
        for _ in 0..256 {
            if selector.select(&pool).unwrap().id == "b" {
                picked_last = true;
                break;
            }
        }
        assert!(picked_last, "last pool member was never selected");
    }

    #[test]
    fn test_record_is_a_no_op() {
        let selector = Random;
        selector.record(&instance("a", "127.0.0.1:8000"), Some("boom"));
    }

    #[test]
    fn test_name() {
        assert_eq!(Random.name(), "random");
    }
}
