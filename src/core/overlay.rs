//! ER-007: Copy-on-write overlay for speculative execution.

/// A value with an optional speculative layer.
///
/// While forked, reads see the layer if one exists and the base otherwise;
/// the first mutable access copies the base into the layer. Discarding drops
/// the layer, leaving the base exactly as it was before the fork. There is
/// no way to merge a layer back.
#[derive(Debug, Clone)]
pub struct Overlay<T: Clone> {
    base: T,
    layer: Option<T>,
    forked: bool,
}

impl<T: Clone> Overlay<T> {
    pub fn new(base: T) -> Overlay<T> {
        Overlay {
            base,
            layer: None,
            forked: false,
        }
    }

    pub fn get(&self) -> &T {
        self.layer.as_ref().unwrap_or(&self.base)
    }

    pub fn get_mut(&mut self) -> &mut T {
        if self.forked {
            let base = &self.base;
            self.layer.get_or_insert_with(|| base.clone())
        } else {
            &mut self.base
        }
    }

    /// Start routing writes to a speculative layer.
    pub fn fork(&mut self) {
        self.forked = true;
    }

    /// Drop the speculative layer.
    pub fn discard(&mut self) {
        self.layer = None;
        self.forked = false;
    }

    pub fn is_forked(&self) -> bool {
        self.forked
    }

    /// Whether anything was written since the fork.
    pub fn is_dirty(&self) -> bool {
        self.layer.is_some()
    }

    pub fn into_inner(self) -> T {
        self.base
    }
}

/// State that can be forked and discarded as a unit.
pub trait Speculate {
    fn fork(&mut self);
    fn discard(&mut self);
}

impl<T: Clone> Speculate for Overlay<T> {
    fn fork(&mut self) {
        Overlay::fork(self)
    }

    fn discard(&mut self) {
        Overlay::discard(self)
    }
}

impl<A: Speculate, B: Speculate> Speculate for (&mut A, &mut B) {
    fn fork(&mut self) {
        self.0.fork();
        self.1.fork();
    }

    fn discard(&mut self) {
        self.0.discard();
        self.1.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_er007_reads_through_until_written() {
        let mut ov = Overlay::new(vec![1, 2]);
        ov.fork();
        assert_eq!(ov.get(), &vec![1, 2]);
        assert!(!ov.is_dirty());
        ov.get_mut().push(3);
        assert!(ov.is_dirty());
        assert_eq!(ov.get(), &vec![1, 2, 3]);
    }

    #[test]
    fn test_er007_discard_restores_base() {
        let mut ov = Overlay::new(String::from("base"));
        ov.fork();
        ov.get_mut().push_str("-guess");
        ov.discard();
        assert_eq!(ov.get(), "base");
        assert!(!ov.is_forked());
        ov.get_mut().push_str("-real");
        assert_eq!(ov.into_inner(), "base-real");
    }

    #[test]
    fn test_er007_unforked_writes_go_to_base() {
        let mut ov = Overlay::new(5usize);
        *ov.get_mut() += 1;
        ov.fork();
        ov.discard();
        assert_eq!(*ov.get(), 6);
    }
}
