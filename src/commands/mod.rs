pub mod llen;
pub mod memory;
pub mod ping;
pub mod scan;

use strum_macros::{Display, EnumString, IntoStaticStr};

use crate::command::Arg;

pub use llen::Llen;
pub use memory::Memory;
pub use ping::Ping;
pub use scan::{Scan, ScanResponse};

/// Command keywords and sub-command tokens sent by the builders in this module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, IntoStaticStr, Display)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Keyword {
    Count,
    Discard,
    Exec,
    Llen,
    Match,
    Memory,
    Multi,
    Ping,
    Samples,
    Scan,
    Type,
    Usage,
}

impl From<Keyword> for Arg {
    fn from(keyword: Keyword) -> Self {
        Arg::Str(<&'static str>::from(keyword).to_string())
    }
}
