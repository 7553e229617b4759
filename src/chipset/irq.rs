//! Interrupt fabric: named lines, routing, and EOI broadcast
//!
//! Wiring is two-step to avoid device↔chipset reference cycles: the
//! [`LineSet`] hands out opaque [`IrqLine`] handles at build time; devices
//! retain handles (never chipset references) and call
//! `assert`/`deassert`/`pulse` on them. Pin changes fan out to the attached
//! [`IrqRouter`] (the PIC/IOAPIC pair), and EOI broadcasts travel the other
//! way so level-triggered lines that are still high get re-delivered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::trace;

use crate::Result;

/// Trigger mode of an interrupt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Edge,
    Level,
}

/// Sink for pin-level changes and EOI notifications: implemented by the
/// interrupt-controller devices (PIC pins 0–15, IOAPIC pins 0–23).
pub trait IrqRouter: Send + Sync {
    /// A line routed to `pin` changed level.
    fn set_pin(&self, pin: u32, high: bool);

    /// The guest's LAPIC acknowledged `vector`. The router owning the line
    /// that delivered it may re-assert still-high level-triggered pins.
    fn eoi(&self, vector: u8);
}

/// Delivers interrupt vectors into the VT layer (MSI-style address/data on
/// x86, SPI numbers elsewhere). The KVM backend implements this with
/// `KVM_SIGNAL_MSI`; tests use a recording fake.
pub trait VectorInjector: Send + Sync {
    fn signal(&self, address: u64, data: u32) -> Result<()>;
}

struct LineState {
    name: String,
    pin: u32,
    level: AtomicBool,
    routers: RwLock<Vec<Arc<dyn IrqRouter>>>,
}

/// Opaque handle to one interrupt line. Cheap to clone; devices keep these.
#[derive(Clone)]
pub struct IrqLine {
    state: Arc<LineState>,
}

impl IrqLine {
    /// Drive the line high. Level-triggered consumers keep seeing it until
    /// `deassert`.
    pub fn assert(&self) {
        self.set_level(true);
    }

    /// Drive the line low.
    pub fn deassert(&self) {
        self.set_level(false);
    }

    /// One full edge: assert immediately followed by deassert. The router
    /// sees both transitions, so an edge is never lost.
    pub fn pulse(&self) {
        self.set_level(true);
        self.set_level(false);
    }

    pub fn is_high(&self) -> bool {
        self.state.level.load(Ordering::Acquire)
    }

    pub fn pin(&self) -> u32 {
        self.state.pin
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    fn set_level(&self, high: bool) {
        self.state.level.store(high, Ordering::Release);
        trace!(line = %self.state.name, pin = self.state.pin, high, "irq edge");
        for router in self.state.routers.read().unwrap().iter() {
            router.set_pin(self.state.pin, high);
        }
    }
}

/// Allocates named interrupt lines and owns the router list.
pub struct LineSet {
    lines: Mutex<Vec<Arc<LineState>>>,
    routers: RwLock<Vec<Arc<dyn IrqRouter>>>,
}

impl Default for LineSet {
    fn default() -> Self {
        Self::new()
    }
}

impl LineSet {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            routers: RwLock::new(Vec::new()),
        }
    }

    /// Allocate a named line routed to `pin`. Pin numbers are the ISA/GSI
    /// space the attached routers interpret.
    pub fn allocate(&self, name: &str, pin: u32) -> IrqLine {
        let state = Arc::new(LineState {
            name: name.to_string(),
            pin,
            level: AtomicBool::new(false),
            routers: RwLock::new(self.routers.read().unwrap().clone()),
        });
        self.lines.lock().unwrap().push(state.clone());
        IrqLine { state }
    }

    /// Attach a router (PIC, IOAPIC). Existing lines are re-wired so
    /// allocation and attachment order don't matter during chipset build.
    pub fn attach_router(&self, router: Arc<dyn IrqRouter>) {
        self.routers.write().unwrap().push(router.clone());
        for line in self.lines.lock().unwrap().iter() {
            line.routers.write().unwrap().push(router.clone());
        }
    }

    /// Broadcast an EOI from the guest LAPIC to every router.
    pub fn broadcast_eoi(&self, vector: u8) {
        trace!(vector, "eoi broadcast");
        for router in self.routers.read().unwrap().iter() {
            router.eoi(vector);
        }
    }

    /// Drive the first line routed to `pin` (the hypervisor-facing
    /// `set_irq` entry point). Returns false when no line claims the pin.
    pub fn set_level(&self, pin: u32, high: bool) -> bool {
        let line = self
            .lines
            .lock()
            .unwrap()
            .iter()
            .find(|l| l.pin == pin)
            .cloned();
        match line {
            Some(state) => {
                IrqLine { state }.set_level(high);
                true
            }
            None => false,
        }
    }

    /// Current level of the line routed to `pin`, if any line is.
    pub fn pin_level(&self, pin: u32) -> bool {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .any(|l| l.pin == pin && l.level.load(Ordering::Acquire))
    }

    /// Names of all allocated lines, in allocation order.
    pub fn line_names(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .map(|l| l.name.clone())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records every MSI signal; stands in for the KVM injector in tests.
    #[derive(Default)]
    pub(crate) struct RecordingInjector {
        pub(crate) signals: Mutex<Vec<(u64, u32)>>,
    }

    impl VectorInjector for RecordingInjector {
        fn signal(&self, address: u64, data: u32) -> Result<()> {
            self.signals.lock().unwrap().push((address, data));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingRouter {
        edges: Mutex<Vec<(u32, bool)>>,
        eois: AtomicUsize,
    }

    impl IrqRouter for RecordingRouter {
        fn set_pin(&self, pin: u32, high: bool) {
            self.edges.lock().unwrap().push((pin, high));
        }
        fn eoi(&self, _vector: u8) {
            self.eois.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn pulse_preserves_both_edges() {
        let set = LineSet::new();
        let router = Arc::new(RecordingRouter::default());
        set.attach_router(router.clone());
        let line = set.allocate("serial", 4);

        line.pulse();
        let edges = router.edges.lock().unwrap().clone();
        assert_eq!(edges, vec![(4, true), (4, false)]);
    }

    #[test]
    fn router_attached_after_allocation_still_sees_edges() {
        let set = LineSet::new();
        let line = set.allocate("rtc", 8);
        let router = Arc::new(RecordingRouter::default());
        set.attach_router(router.clone());

        line.assert();
        assert_eq!(router.edges.lock().unwrap().as_slice(), &[(8, true)]);
        assert!(set.pin_level(8));
    }

    #[test]
    fn eoi_reaches_every_router() {
        let set = LineSet::new();
        let a = Arc::new(RecordingRouter::default());
        let b = Arc::new(RecordingRouter::default());
        set.attach_router(a.clone());
        set.attach_router(b.clone());

        set.broadcast_eoi(0x51);
        assert_eq!(a.eois.load(Ordering::SeqCst), 1);
        assert_eq!(b.eois.load(Ordering::SeqCst), 1);
    }
}
