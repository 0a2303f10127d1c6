mod config;
mod device;
mod key;
pub mod link;
pub mod wg;

pub use crate::{config::*, device::*, key::*, link::LinkController, wg::WgController};
pub use link::NetlinkLinkController;
pub use wg::NetlinkWgController;
