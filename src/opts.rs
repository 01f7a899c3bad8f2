//! COPY stream options.

use no_panic::no_panic;

use crate::error::{Error, Result};

/// Default buffering threshold in bytes.
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// Options for a COPY session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOpts {
    /// Buffering threshold in bytes.
    ///
    /// COPY TO: the largest chunk requested from the connection per read.
    /// Content decoded from one chunk is pushed as one item, so this also
    /// bounds the size of each item yielded to the consumer.
    ///
    /// COPY FROM: the largest payload carried by one outbound CopyData
    /// message. Larger writes are accepted partially.
    ///
    /// Default: `16384`
    pub high_water_mark: usize,
}

impl Default for CopyOpts {
    #[no_panic]
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

impl CopyOpts {
    /// Set the buffering threshold.
    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.high_water_mark == 0 {
            return Err(Error::InvalidUsage(
                "high_water_mark must be at least 1 byte".into(),
            ));
        }
        Ok(())
    }
}
