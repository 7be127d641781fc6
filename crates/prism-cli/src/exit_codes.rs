//! Process exit codes of the `prism` binary.

use prism_core::PrismError;

pub const OK: i32 = 0;
/// The command ran but found nothing (no snippet match, unknown column).
pub const NOT_FOUND: i32 = 1;
pub const CONFIG_ERROR: i32 = 2;

/// Library errors carry their own code; anything else is a config-class failure.
pub fn for_error(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<PrismError>()
        .map_or(CONFIG_ERROR, PrismError::exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prism_errors_keep_their_code() {
        let err = anyhow::Error::new(PrismError::cache("disk full"));
        assert_eq!(for_error(&err), 3);
        assert_eq!(for_error(&anyhow::anyhow!("boom")), CONFIG_ERROR);
    }
}
