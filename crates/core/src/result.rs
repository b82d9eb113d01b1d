//! Result type definition and extension traits.

use crate::error::Error;

/// The standard Result type for keel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing logging combinators for Results.
pub trait ResultExt<T> {
    /// Convert a Result to an Option, logging the error at `warn` if present.
    fn ok_logged(self, context: &str) -> Option<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn ok_logged(self, context: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(context, error = %e, "Operation failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_logged_passes_value_through() {
        let result: Result<u32> = Ok(7);
        assert_eq!(result.ok_logged("test"), Some(7));
    }

    #[test]
    fn test_ok_logged_drops_error() {
        let result: Result<u32> = Err(Error::MissingVersion);
        assert_eq!(result.ok_logged("test"), None);
    }
}
