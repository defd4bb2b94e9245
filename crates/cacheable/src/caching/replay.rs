//! Memoization of stream-producing functions.
//!
//! An invocation consumes the producer's stream once, in a background task, and buffers its
//! values in a [`Replayed`]. Subscribers receive every value as soon as it is buffered; anyone
//! subscribing later first gets all values buffered so far. The buffer is stored once the stream
//! ends successfully, and later hits replay it in full.

use std::convert::Infallible;
use std::fmt;
use std::future::{self, Future};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, TryFutureExt};
use futures::stream::{self, BoxStream, Stream};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::watch;

use super::arguments::{Arguments, NormalizedArgs};
use super::error::CallError;
use super::memoizer::{Memoizer, Producer};
use crate::utils::futures::CallOnDrop;

/// An asynchronous function returning a stream of values.
pub trait StreamProducer: Send + Sync + 'static {
    type Item: Clone + Send + Sync + 'static;
    type Error: Clone + Send + Sync + 'static;
    type Stream: Stream<Item = Result<Self::Item, Self::Error>> + Send + 'static;

    fn produce_stream(&self, args: NormalizedArgs) -> Self::Stream;
}

impl<F, St, T, E> StreamProducer for F
where
    F: Fn(NormalizedArgs) -> St + Send + Sync + 'static,
    St: Stream<Item = Result<T, E>> + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    type Item = T;
    type Error = E;
    type Stream = St;

    fn produce_stream(&self, args: NormalizedArgs) -> Self::Stream {
        self(args)
    }
}

/// How a buffered stream ended.
#[derive(Clone, Debug)]
enum End<E> {
    Complete,
    Failed(E),
    /// The task consuming the stream went away before the stream ended.
    Cancelled,
}

#[derive(Debug)]
struct Buffer<T, E> {
    values: Vec<T>,
    end: Option<End<E>>,
}

/// The values emitted by one run of a [`StreamProducer`], in order.
///
/// The buffer may still be filling up. Cloning yields another handle to the same buffer.
pub struct Replayed<T, E = Infallible> {
    buffer: Arc<watch::Sender<Buffer<T, E>>>,
}

impl<T, E> Clone for Replayed<T, E> {
    fn clone(&self) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl<T, E> Replayed<T, E> {
    fn with_buffer(buffer: Buffer<T, E>) -> Self {
        Self {
            buffer: Arc::new(watch::Sender::new(buffer)),
        }
    }

    fn live() -> Self {
        Self::with_buffer(Buffer {
            values: Vec::new(),
            end: None,
        })
    }

    fn push(&self, value: T) {
        self.buffer.send_modify(|buffer| buffer.values.push(value));
    }

    /// Records how the stream ended. Only the first call has an effect.
    fn finish(&self, end: End<E>) {
        self.buffer.send_if_modified(|buffer| {
            if buffer.end.is_some() {
                return false;
            }
            buffer.end = Some(end);
            true
        });
    }

    pub fn len(&self) -> usize {
        self.buffer.borrow().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.borrow().values.is_empty()
    }

    /// Whether the stream ended successfully, so no more values will be buffered.
    pub fn is_complete(&self) -> bool {
        matches!(self.buffer.borrow().end, Some(End::Complete))
    }
}

impl<T, E> Replayed<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// The values buffered so far.
    pub fn values(&self) -> Vec<T> {
        self.buffer.borrow().values.clone()
    }

    /// The latest buffered value.
    pub fn last(&self) -> Option<T> {
        self.buffer.borrow().values.last().cloned()
    }

    /// Streams all buffered values, then follows the buffer until the stream ends.
    ///
    /// A failed stream yields its error after the values emitted before it.
    pub fn stream(&self) -> impl Stream<Item = Result<T, E>> + Send + use<T, E> {
        self.items().filter_map(|item| {
            future::ready(match item {
                Ok(value) => Some(Ok(value)),
                Err(End::Failed(error)) => Some(Err(error)),
                Err(_) => None,
            })
        })
    }

    fn items(&self) -> impl Stream<Item = Result<T, End<E>>> + Send + use<T, E> {
        let receiver = self.buffer.subscribe();
        stream::unfold(Some((receiver, 0)), |cursor| async move {
            let (mut receiver, index) = cursor?;
            loop {
                let next = {
                    let buffer = receiver.borrow_and_update();
                    match buffer.values.get(index) {
                        Some(value) => Some(Ok(value.clone())),
                        None => buffer.end.clone().map(Err),
                    }
                };

                match next {
                    Some(Ok(value)) => return Some((Ok(value), Some((receiver, index + 1)))),
                    Some(Err(End::Complete)) => return None,
                    Some(Err(end)) => return Some((Err(end), None)),
                    None => receiver.changed().await.ok()?,
                }
            }
        })
    }

    /// Resolves once the stream ended, to whether it ended successfully.
    fn finished(&self) -> impl Future<Output = bool> + Send + use<T, E> {
        let mut receiver = self.buffer.subscribe();
        async move {
            match receiver.wait_for(|buffer| buffer.end.is_some()).await {
                Ok(buffer) => matches!(buffer.end, Some(End::Complete)),
                Err(_) => false,
            }
        }
    }

    /// Consumes `source` into the buffer.
    async fn fill<St>(self, source: St)
    where
        St: Stream<Item = Result<T, E>>,
    {
        // Also fires if the stream panics, so subscribers are never left waiting.
        let cancel_token = {
            let buffer = self.clone();
            CallOnDrop::new(move || buffer.finish(End::Cancelled))
        };

        let mut source = std::pin::pin!(source);
        while let Some(item) = source.next().await {
            match item {
                Ok(value) => self.push(value),
                Err(error) => {
                    self.finish(End::Failed(error));
                    break;
                }
            }
        }
        self.finish(End::Complete);
        drop(cancel_token);
    }
}

impl<T, E> From<Vec<T>> for Replayed<T, E> {
    /// Creates a complete buffer.
    fn from(values: Vec<T>) -> Self {
        Self::with_buffer(Buffer {
            values,
            end: Some(End::Complete),
        })
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Replayed<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buffer = self.buffer.borrow();
        f.debug_struct("Replayed")
            .field("values", &buffer.values)
            .field("end", &buffer.end)
            .finish()
    }
}

impl<T: Serialize, E> Serialize for Replayed<T, E> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.buffer.borrow().values.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>, E> Deserialize<'de> for Replayed<T, E> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::deserialize(deserializer).map(Self::from)
    }
}

/// Adapts a [`StreamProducer`] into a [`Producer`] of [`Replayed`] values.
///
/// The invocation resolves right away with a buffer that a spawned task fills from the stream.
/// The invocation stays joinable until the stream ends, and the buffer is only stored if the
/// stream ends without an error.
#[derive(Clone, Debug)]
pub struct Replay<S>(pub S);

impl<S: StreamProducer> Producer for Replay<S> {
    type Output = Replayed<S::Item, S::Error>;
    type Error = S::Error;
    type Future = future::Ready<Result<Self::Output, Self::Error>>;

    fn produce(&self, args: NormalizedArgs) -> Self::Future {
        let replayed = Replayed::live();
        tokio::spawn(replayed.clone().fill(self.0.produce_stream(args)));
        future::ready(Ok(replayed))
    }

    fn settled(&self, output: &Self::Output) -> Option<BoxFuture<'static, bool>> {
        Some(output.finished().boxed())
    }
}

impl<S: StreamProducer> Memoizer<Replay<S>> {
    /// Resolves a call with `args` and streams its values as they are produced.
    pub fn call_stream(
        &self,
        args: impl Into<Arguments>,
    ) -> BoxStream<'static, Result<S::Item, CallError<S::Error>>> {
        let name = self.name().to_owned();
        self.call(args)
            .map_ok(move |replayed| {
                replayed.items().map(move |item| {
                    item.map_err(|end| match end {
                        End::Failed(error) => CallError::Producer(error),
                        _ => CallError::Cancelled(name.clone()),
                    })
                })
            })
            .try_flatten_stream()
            .boxed()
    }
}

/// Collects a stream into a complete [`Replayed`], for callers bypassing the memoizer.
pub fn collect_stream<St, T, E>(stream: St) -> impl Future<Output = Result<Replayed<T, E>, E>>
where
    St: Stream<Item = Result<T, E>>,
{
    stream.try_collect::<Vec<_>>().map_ok(Replayed::from)
}
