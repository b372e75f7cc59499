#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![doc = include_str!("../README.md")]

pub use nostr;

pub mod bus;
pub mod constant;
mod crypto;
pub mod device;
pub mod error;
pub mod invite;
pub mod invite_list;
pub mod prelude;
mod serde_util;
pub mod session;
pub mod state;
pub mod store;

pub use self::bus::{EventBus, MemoryBus, Subscription};
pub use self::error::Error;
pub use self::invite::{Decryptor, Encryptor, Invite, InviteListener};
pub use self::invite_list::InviteList;
pub use self::session::{SendResult, Session};
pub use self::state::SessionState;
