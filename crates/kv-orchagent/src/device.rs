//! In-memory southbound device.
//!
//! Holds interface and ACL tables plus ACL bindings, records every call for
//! inspection and supports one-shot fault injection per operation. The
//! device may also create or remove interfaces on its own; such changes are
//! reported through [`MockDevice::subscribe`].

use crate::acl::{Acl, AclDirection};
use crate::interface::Interface;
use kv_orch_common::{KvError, KvResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Device operation, used for call recording and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceOp {
    CreateInterface,
    UpdateInterface,
    DeleteInterface,
    DumpInterfaces,
    CreateAcl,
    UpdateAcl,
    DeleteAcl,
    DumpAcls,
    BindAcl,
    UnbindAcl,
}

impl fmt::Display for DeviceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateInterface => "create-interface",
            Self::UpdateInterface => "update-interface",
            Self::DeleteInterface => "delete-interface",
            Self::DumpInterfaces => "dump-interfaces",
            Self::CreateAcl => "create-acl",
            Self::UpdateAcl => "update-acl",
            Self::DeleteAcl => "delete-acl",
            Self::DumpAcls => "dump-acls",
            Self::BindAcl => "bind-acl",
            Self::UnbindAcl => "unbind-acl",
        };
        write!(f, "{}", name)
    }
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCall {
    pub op: DeviceOp,
    /// Name of the object the call targeted
    pub target: String,
}

impl fmt::Display for DeviceCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.target)
    }
}

/// Change made by the device itself.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    InterfaceAdded { index: u32, interface: Interface },
    InterfaceRemoved { name: String },
}

/// Interface entry of the device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInterface {
    pub index: u32,
    pub config: Interface,
    /// Created by the device, not through the agent
    pub external: bool,
}

/// ACL entry of the device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAcl {
    pub index: u32,
    pub config: Acl,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    op: DeviceOp,
    retriable: bool,
}

#[derive(Debug, Default)]
struct DeviceState {
    next_index: u32,
    interfaces: BTreeMap<String, DeviceInterface>,
    acls: BTreeMap<String, DeviceAcl>,
    bindings: BTreeSet<(u32, AclDirection, u32)>,
    calls: Vec<DeviceCall>,
    faults: VecDeque<Fault>,
    subscribers: Vec<mpsc::UnboundedSender<DeviceEvent>>,
}

impl DeviceState {
    fn begin(&mut self, op: DeviceOp, target: &str) -> KvResult<()> {
        self.calls.push(DeviceCall {
            op,
            target: target.to_string(),
        });
        if let Some(pos) = self.faults.iter().position(|f| f.op == op) {
            let fault = self.faults.remove(pos).unwrap_or(Fault { op, retriable: false });
            tracing::debug!(op = %op, target = %target, retriable = fault.retriable, "injected device failure");
            let message = format!("{} {} failed (injected)", op, target);
            return Err(if fault.retriable {
                KvError::transient(message)
            } else {
                KvError::permanent(message)
            });
        }
        Ok(())
    }

    fn allocate_index(&mut self) -> u32 {
        self.next_index += 1;
        self.next_index
    }

    fn notify(&mut self, event: DeviceEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Shared handle of the in-memory device.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call of `op` fail once. Calls queue up.
    pub fn fail_next(&self, op: DeviceOp, retriable: bool) {
        self.state.lock().faults.push_back(Fault { op, retriable });
    }

    /// Recorded calls, oldest first.
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    /// Returns and clears the recorded calls.
    pub fn take_calls(&self) -> Vec<DeviceCall> {
        std::mem::take(&mut self.state.lock().calls)
    }

    /// Recorded calls of one operation.
    pub fn calls_of(&self, op: DeviceOp) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .map(|c| c.target.clone())
            .collect()
    }

    /// Receives interface changes made by the device itself.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DeviceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().subscribers.push(tx);
        rx
    }

    // ===== interfaces =====

    pub fn create_interface(&self, config: &Interface) -> KvResult<u32> {
        let mut state = self.state.lock();
        state.begin(DeviceOp::CreateInterface, &config.name)?;
        if state.interfaces.contains_key(&config.name) {
            return Err(KvError::permanent(format!("interface {} already exists", config.name)));
        }
        let index = state.allocate_index();
        state.interfaces.insert(
            config.name.clone(),
            DeviceInterface {
                index,
                config: config.clone(),
                external: false,
            },
        );
        Ok(index)
    }

    pub fn update_interface(&self, index: u32, config: &Interface) -> KvResult<()> {
        let mut state = self.state.lock();
        state.begin(DeviceOp::UpdateInterface, &config.name)?;
        let entry = state
            .interfaces
            .values_mut()
            .find(|i| i.index == index)
            .ok_or_else(|| KvError::permanent(format!("no interface with index {}", index)))?;
        entry.config = config.clone();
        Ok(())
    }

    pub fn delete_interface(&self, index: u32) -> KvResult<()> {
        let mut state = self.state.lock();
        let name = state
            .interfaces
            .values()
            .find(|i| i.index == index)
            .map(|i| i.config.name.clone())
            .unwrap_or_else(|| format!("#{}", index));
        state.begin(DeviceOp::DeleteInterface, &name)?;
        if state.interfaces.remove(&name).is_none() {
            return Err(KvError::permanent(format!("no interface with index {}", index)));
        }
        if state.bindings.iter().any(|(_, _, i)| *i == index) {
            tracing::warn!(interface = %name, "interface deleted while ACLs are still bound");
            state.bindings.retain(|(_, _, i)| *i != index);
        }
        Ok(())
    }

    pub fn dump_interfaces(&self) -> KvResult<Vec<DeviceInterface>> {
        let mut state = self.state.lock();
        state.begin(DeviceOp::DumpInterfaces, "*")?;
        Ok(state.interfaces.values().cloned().collect())
    }

    pub fn interface(&self, name: &str) -> Option<DeviceInterface> {
        self.state.lock().interfaces.get(name).cloned()
    }

    /// Creates an interface as if the device did it on its own.
    pub fn add_external_interface(&self, config: Interface) -> u32 {
        let mut state = self.state.lock();
        let index = state.allocate_index();
        state.interfaces.insert(
            config.name.clone(),
            DeviceInterface {
                index,
                config: config.clone(),
                external: true,
            },
        );
        state.notify(DeviceEvent::InterfaceAdded {
            index,
            interface: config,
        });
        index
    }

    /// Removes an interface behind the agent's back. Removal of an
    /// interface the device created itself is reported to subscribers.
    pub fn remove_interface_externally(&self, name: &str) -> bool {
        self.remove_interface(name, true)
    }

    /// Removes an interface without reporting it, as if the event got lost.
    pub fn forget_interface(&self, name: &str) -> bool {
        self.remove_interface(name, false)
    }

    fn remove_interface(&self, name: &str, report: bool) -> bool {
        let mut state = self.state.lock();
        let Some(removed) = state.interfaces.remove(name) else {
            return false;
        };
        state.bindings.retain(|(_, _, i)| *i != removed.index);
        if removed.external && report {
            state.notify(DeviceEvent::InterfaceRemoved {
                name: name.to_string(),
            });
        }
        true
    }

    // ===== ACLs =====

    pub fn create_acl(&self, config: &Acl) -> KvResult<u32> {
        let mut state = self.state.lock();
        state.begin(DeviceOp::CreateAcl, &config.name)?;
        if state.acls.contains_key(&config.name) {
            return Err(KvError::permanent(format!("ACL {} already exists", config.name)));
        }
        let index = state.allocate_index();
        state.acls.insert(
            config.name.clone(),
            DeviceAcl {
                index,
                config: config.clone(),
            },
        );
        Ok(index)
    }

    pub fn update_acl(&self, index: u32, config: &Acl) -> KvResult<()> {
        let mut state = self.state.lock();
        state.begin(DeviceOp::UpdateAcl, &config.name)?;
        let entry = state
            .acls
            .values_mut()
            .find(|a| a.index == index)
            .ok_or_else(|| KvError::permanent(format!("no ACL with index {}", index)))?;
        entry.config = config.clone();
        Ok(())
    }

    pub fn delete_acl(&self, index: u32) -> KvResult<()> {
        let mut state = self.state.lock();
        let name = state
            .acls
            .values()
            .find(|a| a.index == index)
            .map(|a| a.config.name.clone())
            .unwrap_or_else(|| format!("#{}", index));
        state.begin(DeviceOp::DeleteAcl, &name)?;
        if state.bindings.iter().any(|(a, _, _)| *a == index) {
            return Err(KvError::permanent(format!("ACL {} is still bound", name)));
        }
        state
            .acls
            .remove(&name)
            .map(|_| ())
            .ok_or_else(|| KvError::permanent(format!("no ACL with index {}", index)))
    }

    pub fn dump_acls(&self) -> KvResult<Vec<DeviceAcl>> {
        let mut state = self.state.lock();
        state.begin(DeviceOp::DumpAcls, "*")?;
        Ok(state.acls.values().cloned().collect())
    }

    pub fn acl(&self, name: &str) -> Option<DeviceAcl> {
        self.state.lock().acls.get(name).cloned()
    }

    pub fn bind_acl(&self, acl_index: u32, direction: AclDirection, if_index: u32) -> KvResult<()> {
        let mut state = self.state.lock();
        state.begin(DeviceOp::BindAcl, &format!("{}:{}:{}", acl_index, direction, if_index))?;
        if !state.acls.values().any(|a| a.index == acl_index) {
            return Err(KvError::permanent(format!("no ACL with index {}", acl_index)));
        }
        if !state.interfaces.values().any(|i| i.index == if_index) {
            return Err(KvError::permanent(format!("no interface with index {}", if_index)));
        }
        state.bindings.insert((acl_index, direction, if_index));
        Ok(())
    }

    pub fn unbind_acl(&self, acl_index: u32, direction: AclDirection, if_index: u32) -> KvResult<()> {
        let mut state = self.state.lock();
        state.begin(DeviceOp::UnbindAcl, &format!("{}:{}:{}", acl_index, direction, if_index))?;
        if !state.bindings.remove(&(acl_index, direction, if_index)) {
            // bindings go away together with their interface
            if !state.interfaces.values().any(|i| i.index == if_index) {
                tracing::debug!(acl_index, if_index, "interface is gone, nothing to unbind");
                return Ok(());
            }
            return Err(KvError::permanent(format!(
                "ACL {} is not bound to interface {} ({})",
                acl_index, if_index, direction
            )));
        }
        Ok(())
    }

    /// Bindings as `(acl name, direction, interface name)`.
    pub fn bindings(&self) -> Vec<(String, AclDirection, String)> {
        let state = self.state.lock();
        let acl_name = |index: u32| {
            state
                .acls
                .values()
                .find(|a| a.index == index)
                .map(|a| a.config.name.clone())
        };
        let if_name = |index: u32| {
            state
                .interfaces
                .values()
                .find(|i| i.index == index)
                .map(|i| i.config.name.clone())
        };
        state
            .bindings
            .iter()
            .filter_map(|(acl, dir, intf)| Some((acl_name(*acl)?, *dir, if_name(*intf)?)))
            .collect()
    }
}
