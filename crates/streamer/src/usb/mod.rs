//! libusb backend
//!
//! Opens the device under test, resolves the endpoint to stream on, and
//! drives asynchronous libusb transfers for the engine.
//!
//! Everything here runs on the thread executing the run: libusb callbacks
//! fire from inside `handle_events`, which the engine calls from its event
//! loop only.

pub mod device;
pub mod transport;

pub use device::{
    DeviceFilter, EndpointInfo, claim_endpoint, effective_packet_size, find_endpoint, open_device,
};
pub use transport::{LibusbTransfer, LibusbTransport};
