/// The relay behind the outlet.
///
/// `is_outlet_on` reads the hardware back rather than a cached flag, so a
/// button press and a scheduled edge always agree on the current state.
pub trait Outlet {
    /// Drive the relay (and indicator). Setting the current state again is
    /// harmless.
    fn set_outlet(&mut self, on: bool);

    fn is_outlet_on(&self) -> bool;
}

/// Flip the outlet and return the new state.
pub fn toggle(outlet: &mut (impl Outlet + ?Sized)) -> bool {
    let next = !outlet.is_outlet_on();
    outlet.set_outlet(next);
    next
}

impl<T: Outlet + ?Sized> Outlet for Box<T> {
    fn set_outlet(&mut self, on: bool) {
        (**self).set_outlet(on);
    }

    fn is_outlet_on(&self) -> bool {
        (**self).is_outlet_on()
    }
}

/// In-memory relay that records every write.
#[derive(Debug, Clone, Default)]
pub struct RecordingOutlet {
    on: bool,
    writes: Vec<bool>,
}

impl RecordingOutlet {
    pub fn writes(&self) -> &[bool] {
        &self.writes
    }
}

impl Outlet for RecordingOutlet {
    fn set_outlet(&mut self, on: bool) {
        self.on = on;
        self.writes.push(on);
    }

    fn is_outlet_on(&self) -> bool {
        self.on
    }
}
