//! Custom validation functions for configuration.
//!
//! Shared validation logic used across the configuration structs.

use validator::ValidationError;

use crate::PoolConfig;

/// Validate that a given value is a power of two.
pub fn validate_power_of_two(value: usize) -> Result<(), ValidationError> {
    if value.is_power_of_two() {
        Ok(())
    } else {
        Err(ValidationError::new("must_be_power_of_two"))
    }
}

/// Validate that the pool holds at least one whole block.
pub fn validate_pool_geometry(config: &PoolConfig) -> Result<(), ValidationError> {
    if config.block_size > config.pool_size {
        return Err(ValidationError::new("block_larger_than_pool"));
    }
    Ok(())
}
