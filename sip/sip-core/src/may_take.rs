use std::ops::{Deref, DerefMut};

/// Handed to every [`Layer`](crate::Layer) and dialog usage, which may inspect the
/// wrapped value or take ownership of it.
///
/// Once taken, the remaining layers no longer see it.
pub struct MayTake<'a, T> {
    slot: &'a mut Option<T>,
}

impl<'a, T> MayTake<'a, T> {
    pub fn new(slot: &'a mut Option<T>) -> Self {
        debug_assert!(slot.is_some());

        Self { slot }
    }

    /// Take ownership of the value
    pub fn take(self) -> T {
        expect_some(self.slot.take())
    }

    /// Access the underlying slot, allowing a value to be taken and put back
    pub fn inner(&mut self) -> &mut Option<T> {
        self.slot
    }
}

impl<T> Deref for MayTake<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        expect_some(self.slot.as_ref())
    }
}

impl<T> DerefMut for MayTake<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        expect_some(self.slot.as_mut())
    }
}

fn expect_some<T>(opt: Option<T>) -> T {
    opt.expect("MayTake must not be used after the value was taken")
}
