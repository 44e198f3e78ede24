/// Fixed ring of per-frame resource sets (command buffers, fences,
/// semaphores, stream pools). The ring index advances once per presented
/// frame and is deliberately independent of whichever swapchain image the
/// driver handed back.
pub struct FrameRing<F> {
    frames: Vec<F>,
    index: usize,
}

impl<F> FrameRing<F> {
    pub fn new(frames: Vec<F>) -> Self {
        assert!(!frames.is_empty());
        Self { frames, index: 0 }
    }

    pub fn current(&self) -> &F {
        &self.frames[self.index]
    }

    pub fn current_mut(&mut self) -> &mut F {
        &mut self.frames[self.index]
    }

    pub fn advance(&mut self) {
        self.index = (self.index + 1) % self.frames.len();
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut F> {
        self.frames.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_round_robin() {
        let mut ring = FrameRing::new(vec!["a", "b", "c"]);
        assert_eq!(*ring.current(), "a");
        ring.advance();
        assert_eq!(*ring.current(), "b");
        ring.advance();
        ring.advance();
        assert_eq!(*ring.current(), "a");
        assert_eq!(ring.index(), 0);
    }
}
