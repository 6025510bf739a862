pub mod browser_manager;
pub mod cdp;
pub mod network_tap;
pub mod remote_sequence;
pub mod scripts;

pub use cdp::{BindingRouter, CdpPage};
pub use network_tap::NetworkTap;
pub use remote_sequence::RemoteSequence;
