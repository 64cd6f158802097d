/// Cycles through a fixed, ordered sequence.
///
/// ```
/// use nsq_reader::RoundRobin;
///
/// let mut endpoints = RoundRobin::new(vec!["a", "b"]);
/// assert_eq!(endpoints.next(), Some(&"a"));
/// assert_eq!(endpoints.next(), Some(&"b"));
/// assert_eq!(endpoints.next(), Some(&"a"));
/// ```
#[derive(Debug, Clone)]
pub struct RoundRobin<T> {
    items: Vec<T>,
    cursor: usize,
}

impl<T> RoundRobin<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items, cursor: 0 }
    }

    // Yields references and never ends, so `Iterator` is a poor fit.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&T> {
        if self.items.is_empty() {
            return None;
        }
        let index = self.cursor % self.items.len();
        self.cursor = (index + 1) % self.items.len();
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
