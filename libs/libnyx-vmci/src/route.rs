//! Routing: decide which personality carries a message
//!
//! `route` is a pure decision table. It reads the personality and context
//! registry state and may fill in an unset source context, but it never
//! performs I/O and never blocks.

use crate::context::ContextRegistry;
use crate::error::{Result, VmciError};
use crate::handle::{context_is_vm, Handle, HOST_CONTEXT_ID, HYPERVISOR_CONTEXT_ID, INVALID_ID};

/// Where a message must go.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Route {
    /// Not routable (never returned by a successful `route`).
    #[default]
    None,
    /// Deliver locally, acting as the host.
    AsHost,
    /// Send down to the host, acting as a guest.
    AsGuest,
}

/// Resolve the route from `src` to `dst`.
///
/// `from_guest` is true only for messages that were relayed up from a guest,
/// which must already carry a real source context.
pub fn route(
    contexts: &ContextRegistry,
    src: &mut Handle,
    dst: &Handle,
    from_guest: bool,
) -> Result<Route> {
    let has_host = contexts.host_active();
    let has_guest = contexts.guest_active();

    if dst.context == INVALID_ID {
        return Err(VmciError::InvalidArgs("invalid destination context"));
    }

    // Anywhere to the hypervisor
    if dst.context == HYPERVISOR_CONTEXT_ID {
        // Only local clients may address the hypervisor
        if from_guest {
            return Err(VmciError::Unreachable);
        }
        if !has_guest {
            return Err(VmciError::DeviceNotFound);
        }
        if src.context == HOST_CONTEXT_ID {
            return Err(VmciError::InvalidArgs("host context cannot reach the hypervisor"));
        }
        // An invalid context with a real resource means "this context";
        // the fully anonymous handle is passed through untouched.
        if src.context == INVALID_ID && src.resource != INVALID_ID {
            src.context = contexts.own_cid();
        }
        return Ok(Route::AsGuest);
    }

    // Anywhere to a local client on the host
    if dst.context == HOST_CONTEXT_ID {
        // Hypervisor-originated events are host-local
        if src.context == HYPERVISOR_CONTEXT_ID {
            return if has_host {
                Ok(Route::AsHost)
            } else {
                Err(VmciError::DeviceNotFound)
            };
        }

        // Local client acting as a guest: send it down. With both
        // personalities this forbids host-local loopback, which keeps the
        // meaning of the host context unambiguous.
        if !from_guest && has_guest {
            if src.context == INVALID_ID {
                src.context = contexts.own_cid();
            }
            return Ok(Route::AsGuest);
        }

        if !has_host {
            return Err(VmciError::DeviceNotFound);
        }
        if src.context == INVALID_ID {
            if from_guest {
                return Err(VmciError::InvalidArgs("guest message without source context"));
            }
            src.context = HOST_CONTEXT_ID;
        }
        return Ok(Route::AsHost);
    }

    // Acting as a host, the destination may be one of our guests
    if has_host {
        if contexts.context_exists(dst.context) {
            if src.context == INVALID_ID {
                if from_guest {
                    return Err(VmciError::InvalidArgs("guest message without source context"));
                }
                src.context = HOST_CONTEXT_ID;
            } else if context_is_vm(src.context) && src.context != dst.context {
                // VM to VM traffic is not supported
                return Err(VmciError::Unreachable);
            }
            return Ok(Route::AsHost);
        }
        if !has_guest {
            return Err(VmciError::Unreachable);
        }
    }

    // A guest addressing another context: let the host resolve it
    if !has_guest {
        return Err(VmciError::DeviceNotFound);
    }
    if src.context == INVALID_ID {
        src.context = contexts.own_cid();
    }
    Ok(Route::AsGuest)
}
