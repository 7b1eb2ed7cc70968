// crates/framebot-streams/src/publishers.rs
//
// Simple sources: a fixed element sequence, the empty stream, and an
// immediately failing stream.

use crate::generators::stateful;
use crate::{Publisher, StreamError, Subscriber, Subscription};

/// Emit the elements of `items` in order, then complete.
pub fn of<T: Send + 'static>(items: Vec<T>) -> impl Publisher<T> {
    stateful(
        move || items.into_iter(),
        |iter, sink| match iter.next() {
            Some(element) => sink.on_next(element),
            None => sink.on_complete(),
        },
    )
}

/// Complete immediately without emitting.
pub fn empty<T: Send + 'static>() -> impl Publisher<T> {
    of(Vec::new())
}

/// Fail immediately with `error`.
pub fn error<T: Send + 'static>(error: StreamError) -> Failed<T> {
    Failed { error, _marker: std::marker::PhantomData }
}

pub struct Failed<T> {
    error: StreamError,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Send + 'static> Publisher<T> for Failed<T> {
    fn subscribe(self: Box<Self>, mut subscriber: Box<dyn Subscriber<T>>) {
        subscriber.on_subscribe(Subscription::detached());
        subscriber.on_error(self.error);
    }
}
