//! Talk Hub - session controllers and message distribution for live
//! customer-support chat.
//!
//! Customers and support agents ("servicers") connect through an adapter that
//! builds a session and hands it to the matching controller. Each controller
//! is one task owning its registry; registries publish talk events through a
//! distribution, either in-process or over an AMQP broker shared by several
//! processes.

pub mod broker;
pub mod config;
pub mod controller;
pub mod distribution;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod session;

pub use config::{FileConfig, load_config};
pub use controller::{ControllerOptions, CustomerController, ServicerController};
pub use distribution::{BrokerDistribution, LocalDistribution};
pub use error::HubError;
pub use hub::Hub;
pub use protocol::{CustomerResponse, MessageView, ServicerResponse, TalkSnapshot};
pub use registry::{CustomerMd, ServicerMd};
pub use session::{CustomerSession, ServicerSession, SessionId};
