//! Runtime tunables (spec §6). Read from the environment at
//! [`Tunables::from_env`], with the stated defaults and valid ranges.

use crate::error::{BmiError, Result};

/// Size of the common header on the wire: `u32 type; u32 credit_return`.
pub const COMMON_HEADER_SIZE: usize = 8;

/// Size of the type-specific header glued onto an eager payload
/// (`u32 bmi_tag`), subtracted from `eager_buf_size` to get the eager
/// payload threshold per spec §6.
pub const EAGER_TYPE_HEADER_SIZE: usize = 4;

const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunables {
    /// Number of eager send/recv buffers per connection pool.
    pub eager_buf_num: usize,
    /// Size in bytes of each eager buffer.
    pub eager_buf_size: usize,
    /// Backlog passed to `listen(2)` on the TCP OOB path.
    pub listen_backlog: usize,
    /// Idle timeout, in milliseconds, for `accept_timeout_ms`-bounded OOB waits.
    pub accept_timeout_ms: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            eager_buf_num: 32,
            eager_buf_size: 2 * MIB,
            listen_backlog: 16384,
            accept_timeout_ms: 2000,
        }
    }
}

impl Tunables {
    /// The largest payload that still takes the eager path: total length
    /// strictly greater than this must take rendezvous (spec §3 invariant e).
    pub fn eager_payload_max(&self) -> usize {
        self.eager_buf_size - COMMON_HEADER_SIZE - EAGER_TYPE_HEADER_SIZE
    }

    /// Load tunables from `BMI_EAGER_BUF_NUM`, `BMI_EAGER_BUF_SIZE`,
    /// `BMI_LISTEN_BACKLOG`, `BMI_ACCEPT_TIMEOUT_MS`, falling back to
    /// defaults for anything unset, and validating whatever was set.
    pub fn from_env() -> Result<Self> {
        let mut t = Tunables::default();

        if let Ok(v) = std::env::var("BMI_EAGER_BUF_NUM") {
            t.eager_buf_num = v
                .parse()
                .map_err(|_| BmiError::Resource(format!("BMI_EAGER_BUF_NUM not a number: {v}")))?;
        }
        if let Ok(v) = std::env::var("BMI_EAGER_BUF_SIZE") {
            t.eager_buf_size = v.parse().map_err(|_| {
                BmiError::Resource(format!("BMI_EAGER_BUF_SIZE not a number: {v}"))
            })?;
        }
        if let Ok(v) = std::env::var("BMI_LISTEN_BACKLOG") {
            t.listen_backlog = v.parse().map_err(|_| {
                BmiError::Resource(format!("BMI_LISTEN_BACKLOG not a number: {v}"))
            })?;
        }
        if let Ok(v) = std::env::var("BMI_ACCEPT_TIMEOUT_MS") {
            t.accept_timeout_ms = v.parse().map_err(|_| {
                BmiError::Resource(format!("BMI_ACCEPT_TIMEOUT_MS not a number: {v}"))
            })?;
        }

        t.validate()?;
        Ok(t)
    }

    fn validate(&self) -> Result<()> {
        if !(1..=256).contains(&self.eager_buf_num) {
            return Err(BmiError::Resource(format!(
                "eager_buf_num {} out of range 1..=256",
                self.eager_buf_num
            )));
        }
        if !(1..=(256 * MIB)).contains(&self.eager_buf_size) {
            return Err(BmiError::Resource(format!(
                "eager_buf_size {} out of range 1..=256MiB",
                self.eager_buf_size
            )));
        }
        if self.eager_buf_size <= COMMON_HEADER_SIZE + EAGER_TYPE_HEADER_SIZE {
            return Err(BmiError::Resource(
                "eager_buf_size too small to hold a header".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let t = Tunables::default();
        assert_eq!(t.eager_buf_num, 32);
        assert_eq!(t.eager_buf_size, 2 * MIB);
        assert_eq!(t.listen_backlog, 16384);
        assert_eq!(t.accept_timeout_ms, 2000);
        assert_eq!(t.eager_payload_max(), 2 * MIB - 12);
    }

    #[test]
    fn rejects_out_of_range_buf_num() {
        let mut t = Tunables::default();
        t.eager_buf_num = 0;
        assert!(t.validate().is_err());
        t.eager_buf_num = 257;
        assert!(t.validate().is_err());
    }

    #[test]
    fn rejects_buf_size_too_small_for_header() {
        let mut t = Tunables::default();
        t.eager_buf_size = 4;
        assert!(t.validate().is_err());
    }
}
