//! iSCSI
//!
//! Session management through `iscsiadm` and the connector that turns a
//! target IQN plus portals into a local block device.

pub mod connector;
pub mod iscsiadm;
pub mod session;
pub mod wait;

pub use connector::IscsiConnector;
pub use iscsiadm::Iscsiadm;
pub use session::{device_path_for, extract_transport_name, parse_discovery, parse_sessions};
pub use wait::wait_for_path_to_exist;
