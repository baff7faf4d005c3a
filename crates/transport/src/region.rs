/// The `[start, end)` window of a track that repeats, in seconds.
///
/// A `LoopRegion` is always well-formed: both bounds are finite,
/// `start >= 0` and `end > start`. The constructors return `None` instead
/// of building anything else.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopRegion {
    start: f64,
    end: f64,
}

impl LoopRegion {
    pub fn new(start: f64, end: f64) -> Option<Self> {
        if start.is_finite() && end.is_finite() && start >= 0.0 && end > start {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// The whole buffer, `[0, duration)`.
    pub fn full(duration: f64) -> Option<Self> {
        Self::new(0.0, duration)
    }

    /// Clamp a requested region into `[0, duration]`. A missing `end` means
    /// the end of the buffer; non-finite values read as their defaults.
    ///
    /// ```
    /// use ambi_transport::LoopRegion;
    ///
    /// let region = LoopRegion::clamped(10.0, -3.0, Some(42.0)).unwrap();
    /// assert_eq!((region.start(), region.end()), (0.0, 10.0));
    /// assert!(LoopRegion::clamped(10.0, 4.0, Some(2.0)).is_none());
    /// ```
    pub fn clamped(duration: f64, start: f64, end: Option<f64>) -> Option<Self> {
        if !duration.is_finite() || duration <= 0.0 {
            return None;
        }
        let start = if start.is_finite() { start } else { 0.0 };
        let start = start.clamp(0.0, duration);
        let end = match end {
            Some(end) if end.is_finite() => end.min(duration),
            _ => duration,
        };
        Self::new(start, end.max(start))
    }

    #[inline]
    pub fn start(&self) -> f64 {
        self.start
    }

    #[inline]
    pub fn end(&self) -> f64 {
        self.end
    }

    #[inline]
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn contains(&self, position: f64) -> bool {
        position >= self.start && position < self.end
    }
}
