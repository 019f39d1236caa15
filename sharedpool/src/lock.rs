#[cfg(feature = "parking_lot")]
mod inner {
    pub(crate) use parking_lot::Mutex;
}

#[cfg(not(feature = "parking_lot"))]
mod inner {
    use std::sync::{MutexGuard, PoisonError};

    #[derive(Debug, Default)]
    pub(crate) struct Mutex<T: ?Sized>(std::sync::Mutex<T>);

    impl<T> Mutex<T> {
        pub(crate) fn new(val: T) -> Self {
            Self(std::sync::Mutex::new(val))
        }
    }

    impl<T: ?Sized> Mutex<T> {
        pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
            self.0.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }
}

pub(crate) use inner::*;
