//! Prelude

#![allow(unknown_lints)]
#![allow(ambiguous_glob_reexports)]
#![doc(hidden)]

pub use nostr::prelude::*;

pub use crate::bus::*;
pub use crate::constant::*;
pub use crate::device::*;
pub use crate::error::*;
pub use crate::invite::*;
pub use crate::invite_list::*;
pub use crate::session::*;
pub use crate::state::*;
pub use crate::store::*;
pub use crate::*;
