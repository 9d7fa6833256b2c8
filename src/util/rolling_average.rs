/// Moving average over the most recent `depth` samples. Starts out growing, and becomes a ring
///  buffer once `depth` samples were added.
pub struct RollingAverage {
    buf: SampleBuffer,
    cached_sum: f64,
}
impl RollingAverage {
    pub fn new(depth: usize) -> Self {
        RollingAverage {
            buf: SampleBuffer::Growing { buf: Vec::with_capacity(depth), depth: depth.max(1) },
            cached_sum: 0.0,
        }
    }

    pub fn add_value(&mut self, value: f64) {
        if let Some(evicted) = self.buf.add_value(value) {
            self.cached_sum -= evicted;
        }
        self.cached_sum += value;
    }

    /// `None` before the first sample
    pub fn mean(&self) -> Option<f64> {
        match self.buf.len() {
            0 => None,
            n => Some(self.cached_sum / n as f64),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
}


enum SampleBuffer {
    Growing {
        buf: Vec<f64>,
        depth: usize,
    },
    Ring {
        buf: Vec<f64>,
        next: usize,
    },
}
impl SampleBuffer {
    fn len(&self) -> usize {
        match self {
            SampleBuffer::Growing { buf, .. } => buf.len(),
            SampleBuffer::Ring { buf, .. } => buf.len(),
        }
    }

    /// adds a new value, returning the value that was evicted in its place (if any)
    #[must_use]
    fn add_value(&mut self, value: f64) -> Option<f64> {
        match self {
            SampleBuffer::Growing { buf, depth } => {
                buf.push(value);
                if buf.len() == *depth {
                    let buf = std::mem::take(buf);
                    *self = SampleBuffer::Ring { buf, next: 0 };
                }
                None
            }
            SampleBuffer::Ring { buf, next } => {
                let evicted = buf[*next];
                buf[*next] = value;
                *next = (*next + 1) % buf.len();
                Some(evicted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(3, vec![], None)]
    #[case::single(3, vec![4.0], Some(4.0))]
    #[case::growing(3, vec![1.0, 2.0], Some(1.5))]
    #[case::full(3, vec![1.0, 2.0, 3.0], Some(2.0))]
    #[case::evicting(3, vec![1.0, 2.0, 3.0, 7.0], Some(4.0))]
    #[case::wrapped_twice(2, vec![1.0, 2.0, 3.0, 4.0, 5.0], Some(4.5))]
    #[case::depth_one(1, vec![1.0, 9.0], Some(9.0))]
    fn test_mean(#[case] depth: usize, #[case] values: Vec<f64>, #[case] expected: Option<f64>) {
        let mut avg = RollingAverage::new(depth);
        for v in &values {
            avg.add_value(*v);
        }
        assert_eq!(avg.mean(), expected);
        assert_eq!(avg.len(), values.len().min(depth));
    }
}
