//! Open-mode handling (spec.md §3): a sum of `New`, `OverWrite`, `Resume`,
//! `Read`, `SkipExisting`. `SkipExisting` has no O/S equivalent — it is
//! its own enum value, resolved at request time rather than mapped to
//! open flags (spec.md §9, open question).

use std::fmt;

use tokio::fs::OpenOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    New,
    OverWrite,
    Resume,
    Read,
    SkipExisting,
}

impl OpenMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OpenMode::New => "New",
            OpenMode::OverWrite => "OverWrite",
            OpenMode::Resume => "Resume",
            OpenMode::Read => "Read",
            OpenMode::SkipExisting => "SkipExisting",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "New" => Some(OpenMode::New),
            "OverWrite" => Some(OpenMode::OverWrite),
            "Resume" => Some(OpenMode::Resume),
            "Read" => Some(OpenMode::Read),
            "SkipExisting" => Some(OpenMode::SkipExisting),
            _ => None,
        }
    }

    /// Is this mode legal input to `requestFileWrite` (spec.md §4.3)?
    pub fn is_write_request_mode(self) -> bool {
        matches!(
            self,
            OpenMode::New | OpenMode::OverWrite | OpenMode::Resume | OpenMode::SkipExisting
        )
    }

    /// Is this mode legal for a `getFile` destination (spec.md §4.3)?
    pub fn is_pull_destination_mode(self) -> bool {
        matches!(self, OpenMode::OverWrite | OpenMode::New | OpenMode::Resume)
    }

    /// Build the `tokio::fs::OpenOptions` for this mode. `SkipExisting` is
    /// resolved by the caller before this is reached (it branches to
    /// either `New`-like or "skip" behavior at request time); calling this
    /// with `SkipExisting` directly is a logic error in this crate, so it
    /// is treated the same as `New` defensively rather than panicking.
    pub fn to_open_options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        match self {
            OpenMode::New => {
                opts.write(true).create_new(true);
            }
            OpenMode::OverWrite => {
                opts.write(true).create(true).truncate(true);
            }
            OpenMode::Resume => {
                opts.write(true).create(true).append(false);
            }
            OpenMode::Read => {
                opts.read(true);
            }
            OpenMode::SkipExisting => {
                opts.write(true).create_new(true);
            }
        }
        opts
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_names() {
        for mode in [
            OpenMode::New,
            OpenMode::OverWrite,
            OpenMode::Resume,
            OpenMode::Read,
            OpenMode::SkipExisting,
        ] {
            assert_eq!(OpenMode::parse(mode.as_str()), Some(mode));
        }
    }

    #[test]
    fn write_request_modes() {
        assert!(OpenMode::New.is_write_request_mode());
        assert!(OpenMode::SkipExisting.is_write_request_mode());
        assert!(!OpenMode::Read.is_write_request_mode());
    }

    #[test]
    fn pull_destination_modes() {
        assert!(OpenMode::Resume.is_pull_destination_mode());
        assert!(!OpenMode::Read.is_pull_destination_mode());
        assert!(!OpenMode::SkipExisting.is_pull_destination_mode());
    }
}
