//! Push-style transducers.
//!
//! A [`Transducer`] is a reusable transformation stage independent of its
//! input source and output sink: each `step` consumes one input and
//! appends zero or more outputs, and `flush` drains any pending state
//! when the input ends. [`transform`](crate::flow::transform) drives a
//! transducer under the flow protocol; the same stage works over any
//! in-memory collection in tests.
//!
//! `Step::Done` requests early termination: the driver must feed no
//! further input (outputs appended by the final step are still valid).
//! A failing step aborts the transformation with its error.

use crate::error::Result;

/// Continuation decision returned by [`Transducer::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep feeding input.
    Continue,
    /// Stop early; feed no further input.
    Done,
}

/// A transformation stage from `A` inputs to `B` outputs.
pub trait Transducer<A, B>: Send + 'static {
    /// Consumes one input, appending any resulting outputs to `out`.
    fn step(&mut self, input: A, out: &mut Vec<B>) -> Result<Step>;

    /// Drains pending state once the input is exhausted.
    fn flush(&mut self, out: &mut Vec<B>) -> Result<()> {
        let _ = out;
        Ok(())
    }
}

/// One output per input.
pub fn map<A, B, F>(f: F) -> impl Transducer<A, B>
where
    F: FnMut(A) -> B + Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
{
    struct Map<F>(F);
    impl<A, B, F> Transducer<A, B> for Map<F>
    where
        F: FnMut(A) -> B + Send + 'static,
        A: Send + 'static,
        B: Send + 'static,
    {
        fn step(&mut self, input: A, out: &mut Vec<B>) -> Result<Step> {
            out.push((self.0)(input));
            Ok(Step::Continue)
        }
    }
    Map(f)
}

/// Passes through inputs matching the predicate.
pub fn filter<A, F>(predicate: F) -> impl Transducer<A, A>
where
    F: FnMut(&A) -> bool + Send + 'static,
    A: Send + 'static,
{
    struct Filter<F>(F);
    impl<A, F> Transducer<A, A> for Filter<F>
    where
        F: FnMut(&A) -> bool + Send + 'static,
        A: Send + 'static,
    {
        fn step(&mut self, input: A, out: &mut Vec<A>) -> Result<Step> {
            if (self.0)(&input) {
                out.push(input);
            }
            Ok(Step::Continue)
        }
    }
    Filter(predicate)
}

/// Zero or more outputs per input, from an iterator.
pub fn flat_map<A, B, I, F>(f: F) -> impl Transducer<A, B>
where
    F: FnMut(A) -> I + Send + 'static,
    I: IntoIterator<Item = B>,
    A: Send + 'static,
    B: Send + 'static,
{
    struct FlatMap<F>(F);
    impl<A, B, I, F> Transducer<A, B> for FlatMap<F>
    where
        F: FnMut(A) -> I + Send + 'static,
        I: IntoIterator<Item = B>,
        A: Send + 'static,
        B: Send + 'static,
    {
        fn step(&mut self, input: A, out: &mut Vec<B>) -> Result<Step> {
            out.extend((self.0)(input));
            Ok(Step::Continue)
        }
    }
    FlatMap(f)
}

/// Passes through the first `n` inputs, then requests termination.
pub fn take<A: Send + 'static>(n: usize) -> impl Transducer<A, A> {
    struct Take {
        remaining: usize,
    }
    impl<A: Send + 'static> Transducer<A, A> for Take {
        fn step(&mut self, input: A, out: &mut Vec<A>) -> Result<Step> {
            if self.remaining == 0 {
                return Ok(Step::Done);
            }
            self.remaining -= 1;
            out.push(input);
            Ok(if self.remaining == 0 {
                Step::Done
            } else {
                Step::Continue
            })
        }
    }
    Take { remaining: n }
}

/// Groups inputs into chunks of `n`; a partial chunk is flushed at the
/// end of input.
pub fn partition_all<A: Send + 'static>(n: usize) -> impl Transducer<A, Vec<A>> {
    assert!(n > 0, "partition size must be positive");
    struct PartitionAll<A> {
        size: usize,
        chunk: Vec<A>,
    }
    impl<A: Send + 'static> Transducer<A, Vec<A>> for PartitionAll<A> {
        fn step(&mut self, input: A, out: &mut Vec<Vec<A>>) -> Result<Step> {
            self.chunk.push(input);
            if self.chunk.len() == self.size {
                out.push(std::mem::take(&mut self.chunk));
            }
            Ok(Step::Continue)
        }

        fn flush(&mut self, out: &mut Vec<Vec<A>>) -> Result<()> {
            if !self.chunk.is_empty() {
                out.push(std::mem::take(&mut self.chunk));
            }
            Ok(())
        }
    }
    PartitionAll {
        size: n,
        chunk: Vec::new(),
    }
}

/// Chains two stages: outputs of `first` feed `second`.
pub fn compose<A, M, B>(
    first: impl Transducer<A, M>,
    second: impl Transducer<M, B>,
) -> impl Transducer<A, B>
where
    A: Send + 'static,
    M: Send + 'static,
    B: Send + 'static,
{
    struct Compose<X, Y, M> {
        first: X,
        second: Y,
        mid: Vec<M>,
    }
    impl<A, M, B, X, Y> Transducer<A, B> for Compose<X, Y, M>
    where
        X: Transducer<A, M>,
        Y: Transducer<M, B>,
        A: Send + 'static,
        M: Send + 'static,
        B: Send + 'static,
    {
        fn step(&mut self, input: A, out: &mut Vec<B>) -> Result<Step> {
            let upstream = self.first.step(input, &mut self.mid)?;
            for m in self.mid.drain(..) {
                if self.second.step(m, out)? == Step::Done {
                    return Ok(Step::Done);
                }
            }
            Ok(upstream)
        }

        fn flush(&mut self, out: &mut Vec<B>) -> Result<()> {
            self.first.flush(&mut self.mid)?;
            for m in self.mid.drain(..) {
                if self.second.step(m, out)? == Step::Done {
                    break;
                }
            }
            self.second.flush(out)
        }
    }
    Compose {
        first,
        second,
        mid: Vec::new(),
    }
}

/// Drives a transducer over an in-memory collection. Used by tests and
/// by callers that want the stage semantics without a flow.
pub fn run<A, B>(
    mut xf: impl Transducer<A, B>,
    inputs: impl IntoIterator<Item = A>,
) -> Result<Vec<B>> {
    let mut out = Vec::new();
    for input in inputs {
        if xf.step(input, &mut out)? == Step::Done {
            return Ok(out);
        }
    }
    xf.flush(&mut out)?;
    Ok(out)
}
