//! libusb asynchronous transport
//!
//! Each pool slot owns one `libusb_transfer`. The completion callback only
//! records the slot index; status and lengths are read back in
//! [`Transport::poll`] once `libusb_handle_events` returns, so no engine
//! state is touched from inside libusb.

use crate::config::{EngineConfig, TransferKind};
use crate::pool::TransferSlot;
use crate::transport::{
    Completion, IsoPacket, TRANSFER_TIMEOUT, TransferStatus, Transport, TransportError,
};
use rusb::ffi::{self, constants};
use rusb::{Context, DeviceHandle, UsbContext};
use std::os::raw::{c_int, c_uint, c_void};
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, trace};

type CompletedSlots = Arc<Mutex<Vec<usize>>>;

/// Handed to libusb as `user_data`
struct CallbackContext {
    slot: usize,
    completed: CompletedSlots,
}

extern "system" fn transfer_callback(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: libusb passes back the transfer we submitted, whose user_data
    // points at the boxed context owned by the same descriptor.
    let context = unsafe { &*((*transfer).user_data as *const CallbackContext) };
    match context.completed.lock() {
        Ok(mut completed) => completed.push(context.slot),
        Err(_) => error!("Completion queue poisoned, slot {} lost", context.slot),
    }
}

/// One libusb transfer bound to a pool slot
pub struct LibusbTransfer {
    raw: NonNull<ffi::libusb_transfer>,
    context: Box<CallbackContext>,
    iso_packets: usize,
}

impl LibusbTransfer {
    fn allocate(
        slot: usize,
        iso_packets: usize,
        completed: CompletedSlots,
    ) -> Result<Self, TransportError> {
        let count = c_int::try_from(iso_packets).map_err(|_| TransportError::InvalidParam)?;
        // SAFETY: plain allocation; a null return is handled below.
        let raw = unsafe { ffi::libusb_alloc_transfer(count) };
        let raw = NonNull::new(raw).ok_or(TransportError::NoMemory)?;

        Ok(Self {
            raw,
            context: Box::new(CallbackContext { slot, completed }),
            iso_packets,
        })
    }

    pub fn slot(&self) -> usize {
        self.context.slot
    }

    /// Fill the transfer for `buffer` and hand it to libusb
    ///
    /// # Safety
    ///
    /// `buffer` must stay valid and unmoved until the callback has fired.
    unsafe fn submit(
        &mut self,
        handle: *mut ffi::libusb_device_handle,
        buffer: &mut [u8],
        config: &EngineConfig,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let length = c_int::try_from(buffer.len()).map_err(|_| TransportError::InvalidParam)?;
        let timeout = c_uint::try_from(timeout.as_millis()).unwrap_or(c_uint::MAX);
        let user_data = ptr::addr_of_mut!(*self.context) as *mut c_void;
        let raw = self.raw.as_ptr();

        unsafe {
            match config.kind {
                TransferKind::Bulk => ffi::libusb_fill_bulk_transfer(
                    raw,
                    handle,
                    config.endpoint,
                    buffer.as_mut_ptr(),
                    length,
                    transfer_callback,
                    user_data,
                    timeout,
                ),
                TransferKind::Interrupt => ffi::libusb_fill_interrupt_transfer(
                    raw,
                    handle,
                    config.endpoint,
                    buffer.as_mut_ptr(),
                    length,
                    transfer_callback,
                    user_data,
                    timeout,
                ),
                TransferKind::Isochronous => {
                    ffi::libusb_fill_iso_transfer(
                        raw,
                        handle,
                        config.endpoint,
                        buffer.as_mut_ptr(),
                        length,
                        self.iso_packets as c_int,
                        transfer_callback,
                        user_data,
                        timeout,
                    );
                    // Lengths are overwritten on completion and must be re-armed
                    ffi::libusb_set_iso_packet_lengths(raw, config.packet_size as c_uint);
                }
            }

            check(ffi::libusb_submit_transfer(raw))
        }
    }

    /// Read back the outcome of a finished transfer
    fn completion(&self) -> Completion {
        let slot = self.slot();
        let raw = self.raw.as_ptr();

        // SAFETY: only called after the callback fired, so libusb no longer
        // writes to the transfer.
        unsafe {
            let status = map_transfer_status((*raw).status);
            if self.iso_packets == 0 {
                return Completion {
                    slot,
                    status,
                    actual_length: (*raw).actual_length.max(0) as usize,
                    iso_packets: Vec::new(),
                };
            }

            let descriptors =
                ptr::addr_of!((*raw).iso_packet_desc) as *const ffi::libusb_iso_packet_descriptor;
            let packets = (0..self.iso_packets)
                .map(|i| {
                    let desc = &*descriptors.add(i);
                    IsoPacket {
                        status: map_transfer_status(desc.status),
                        actual_length: desc.actual_length as usize,
                    }
                })
                .collect();
            Completion::isochronous(slot, status, packets)
        }
    }
}

impl Drop for LibusbTransfer {
    fn drop(&mut self) {
        // SAFETY: the pool never drops a descriptor that is still in flight.
        unsafe { ffi::libusb_free_transfer(self.raw.as_ptr()) };
    }
}

impl std::fmt::Debug for LibusbTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibusbTransfer")
            .field("slot", &self.context.slot)
            .field("iso_packets", &self.iso_packets)
            .finish()
    }
}

/// Streams through libusb's asynchronous API on an opened device
pub struct LibusbTransport {
    handle: DeviceHandle<Context>,
    completed: CompletedSlots,
    timeout: Duration,
}

impl LibusbTransport {
    /// The interface carrying the endpoint must already be claimed
    pub fn new(handle: DeviceHandle<Context>) -> Self {
        Self {
            handle,
            completed: Arc::new(Mutex::new(Vec::new())),
            timeout: TRANSFER_TIMEOUT,
        }
    }

    /// Override the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn handle(&self) -> &DeviceHandle<Context> {
        &self.handle
    }

    pub fn into_handle(self) -> DeviceHandle<Context> {
        self.handle
    }

    fn take_completed(&self) -> Vec<usize> {
        match self.completed.lock() {
            Ok(mut completed) => std::mem::take(&mut *completed),
            Err(_) => {
                error!("Completion queue poisoned");
                Vec::new()
            }
        }
    }
}

impl Transport for LibusbTransport {
    type Descriptor = LibusbTransfer;

    fn alloc_descriptor(
        &mut self,
        slot: usize,
        config: &EngineConfig,
    ) -> Result<LibusbTransfer, TransportError> {
        LibusbTransfer::allocate(slot, config.iso_packets(), Arc::clone(&self.completed))
    }

    fn submit(
        &mut self,
        slot: &mut TransferSlot<LibusbTransfer>,
        config: &EngineConfig,
    ) -> Result<(), TransportError> {
        let handle = self.handle.as_raw();
        let (buffer, transfer) = slot.parts_mut();
        // SAFETY: slot buffers are allocated once per run and never resized;
        // in-flight slots outlive their transfers.
        unsafe { transfer.submit(handle, buffer, config, self.timeout) }
    }

    fn poll(
        &mut self,
        timeout: Duration,
        slots: &[TransferSlot<LibusbTransfer>],
    ) -> Result<Vec<Completion>, TransportError> {
        let result = self.handle.context().handle_events(Some(timeout));

        // Callbacks that fired before an error still count
        let completions: Vec<Completion> = self
            .take_completed()
            .into_iter()
            .filter_map(|index| match slots.get(index) {
                Some(slot) => Some(slot.descriptor().completion()),
                None => {
                    debug!("Callback for unknown slot {}", index);
                    None
                }
            })
            .collect();

        match result {
            Ok(()) => {
                trace!("Event loop returned {} completions", completions.len());
                Ok(completions)
            }
            Err(e) if completions.is_empty() => Err(e.into()),
            Err(e) => {
                debug!("Event handling error after completions: {}", e);
                Ok(completions)
            }
        }
    }
}

/// Map a libusb return code to a transport error
fn check(code: c_int) -> Result<(), TransportError> {
    if code >= 0 {
        return Ok(());
    }

    Err(match code {
        constants::LIBUSB_ERROR_NO_MEM => TransportError::NoMemory,
        constants::LIBUSB_ERROR_BUSY => TransportError::Busy,
        constants::LIBUSB_ERROR_NO_DEVICE => TransportError::NoDevice,
        constants::LIBUSB_ERROR_NOT_FOUND => TransportError::NotFound,
        constants::LIBUSB_ERROR_INVALID_PARAM => TransportError::InvalidParam,
        constants::LIBUSB_ERROR_NOT_SUPPORTED => TransportError::NotSupported,
        constants::LIBUSB_ERROR_IO => TransportError::Io,
        constants::LIBUSB_ERROR_INTERRUPTED => TransportError::Interrupted,
        other => TransportError::Other(format!("libusb error {}", other)),
    })
}

fn map_transfer_status(status: c_int) -> TransferStatus {
    match status {
        constants::LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        constants::LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        constants::LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        constants::LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        constants::LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        constants::LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_transfer_status() {
        assert_eq!(
            map_transfer_status(constants::LIBUSB_TRANSFER_COMPLETED),
            TransferStatus::Completed
        );
        assert_eq!(
            map_transfer_status(constants::LIBUSB_TRANSFER_STALL),
            TransferStatus::Stall
        );
        assert_eq!(
            map_transfer_status(constants::LIBUSB_TRANSFER_ERROR),
            TransferStatus::Error
        );
        assert_eq!(map_transfer_status(42), TransferStatus::Error);
    }

    #[test]
    fn test_check_return_codes() {
        assert!(check(0).is_ok());
        assert!(check(7).is_ok());
        assert_eq!(check(constants::LIBUSB_ERROR_BUSY), Err(TransportError::Busy));
        assert_eq!(
            check(constants::LIBUSB_ERROR_NO_DEVICE),
            Err(TransportError::NoDevice)
        );
        assert!(matches!(check(-99), Err(TransportError::Other(_))));
    }

    #[test]
    fn test_callback_records_slot() {
        let completed: CompletedSlots = Arc::new(Mutex::new(Vec::new()));
        let transfer = LibusbTransfer::allocate(5, 0, Arc::clone(&completed)).unwrap();
        // SAFETY: the transfer was just allocated and is not submitted.
        unsafe {
            (*transfer.raw.as_ptr()).user_data =
                ptr::addr_of!(*transfer.context) as *mut c_void;
        }
        transfer_callback(transfer.raw.as_ptr());
        assert_eq!(*completed.lock().unwrap(), vec![5]);
        assert_eq!(transfer.slot(), 5);
    }
}
