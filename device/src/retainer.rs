/// Keeps a host-side copy of the data a device buffer was seeded from alive.
///
/// Holds no device state. Buffers derived from a host-seeded root share the
/// same retainer through an `Rc`, so the host data lives exactly as long as the
/// last of them.
#[derive(Debug)]
pub struct HostRetainer<T> {
    retained: Box<[T]>,
}

impl<T> HostRetainer<T> {
    pub fn keep(sequence: Vec<T>) -> Self {
        Self { retained: sequence.into_boxed_slice() }
    }

    pub fn len(&self) -> usize {
        self.retained.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.retained
    }
}
