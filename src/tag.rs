/// Hands out buffer identifiers (tags).
///
/// The allocator is a plain value: every constructor takes one and returns it advanced, so the
/// tags a program consumes depend only on the order of its constructor calls. Peers building the
/// same graph in the same order derive the same tags without talking to each other.
#[must_use = "the advanced allocator must be passed to the next constructor"]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagAllocator {
    next: u64,
}

impl TagAllocator {
    /// Creates a new `TagAllocator` whose first tag is 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new `TagAllocator` whose first tag is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self { next: first }
    }

    /// Consumes one tag.
    ///
    /// # Returns
    /// The tag and the advanced allocator.
    pub fn next(self) -> (u64, Self) {
        (
            self.next,
            Self {
                next: self.next + 1,
            },
        )
    }

    /// Returns the tag the next call to `next` would hand out.
    pub fn peek(&self) -> u64 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_consecutive() {
        let tags = TagAllocator::starting_at(5);
        let (a, tags) = tags.next();
        let (b, tags) = tags.next();

        assert_eq!((a, b), (5, 6));
        assert_eq!(tags.peek(), 7);
    }

    #[test]
    fn copies_replay_the_same_sequence() {
        let tags = TagAllocator::new();
        let (a, _) = tags.next();
        let (b, _) = tags.next();

        assert_eq!(a, b);
    }
}
