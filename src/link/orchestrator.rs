//! # Link Lifecycle Orchestrator
//!
//! Straight-line setup of one receive socket. Runs once per logical receiver
//! at startup; nothing is retried.

use tracing::{debug, info};

use super::socket::{resolve_interface_index, LinkSocket};
use crate::error::Result;
use crate::filter::build_filter;
use crate::protocol::addressing::{CommId, Direction, OperatingMode, Port};

/// Open a bound, optionally filtered receive socket
///
/// # Control Flow
///
/// 1. Check that the interface exists (before any descriptor is opened)
/// 2. Open a raw socket for `mode`
/// 3. WIFI_COMPAT: keep the socket blocking, enable promiscuous mode and
///    address reuse
/// 4. MONITOR: build the kernel filter for (`comm_id`, `direction`, `port`)
///    and attach it
/// 5. Bind to the interface
///
/// The first failing step aborts the sequence; the descriptor is closed
/// because the socket is dropped.
///
/// # Errors
///
/// - `LinkError::InterfaceNotFound` if `interface` does not exist
/// - `LinkError::SocketCreateFailed` without `CAP_NET_RAW`
/// - `LinkError::InterfaceControlFailed` if promiscuous mode cannot be set
/// - `LinkError::ConfigFailed` if a socket option cannot be applied
/// - `LinkError::FilterAttachFailed` if the kernel rejects the filter
/// - `LinkError::BindFailed` if binding fails
///
/// # Examples
///
/// ```no_run
/// use db_link::link::open_receive_link;
/// use db_link::protocol::{CommId, Direction, OperatingMode, Port};
///
/// let socket = open_receive_link(
///     "wlan1",
///     OperatingMode::Monitor,
///     CommId::new([0xAA, 0xBB, 0xCC, 0xDD]),
///     Direction::TowardOperator,
///     Port::TELEMETRY,
/// )?;
/// let socket = socket.set_nonblocking()?;
/// # Ok::<(), db_link::error::LinkError>(())
/// ```
pub fn open_receive_link(
    interface: &str,
    mode: OperatingMode,
    comm_id: CommId,
    direction: Direction,
    port: Port,
) -> Result<LinkSocket> {
    let ifindex = resolve_interface_index(interface)?;
    debug!("Interface {} has index {}", interface, ifindex);

    let socket = LinkSocket::create_raw_socket(mode)?;

    let socket = match mode {
        OperatingMode::WifiCompat => socket
            .set_blocking()?
            .enable_promiscuous(interface)?
            .set_reuse_address()?,
        OperatingMode::Monitor => {
            let program = build_filter(comm_id, direction, port);
            socket.attach_filter(&program)?
        }
    };

    let socket = socket.bind_to_interface(interface)?;

    info!(
        "Receive link ready on {} ({} mode, comm id {}, direction {:?}, port {})",
        interface, mode, comm_id, direction, port
    );
    Ok(socket)
}
