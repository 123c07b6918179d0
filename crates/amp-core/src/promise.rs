//! Arena of promise slots.
//!
//! A slot is deferred, forwarded to another slot, or settled. Settling is a
//! one-way transition and reactions never run inside the turn that settles
//! the promise: they are pushed onto the turn queue.

use crate::turn::TurnQueue;
use crate::value::{PromiseId, Ref, Rejection, Settled, Value};
use crate::Result;

/// Continuation run once a promise settles.
pub type Reaction<C> = Box<dyn FnOnce(&mut C, Settled) -> Result<()> + Send>;

/// One-shot capability to settle the paired promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolver {
    promise: PromiseId,
}

impl Resolver {
    pub fn promise(&self) -> PromiseId {
        self.promise
    }
}

/// Observable state of a promise.
#[derive(Debug, PartialEq)]
pub enum State<'a> {
    Deferred,
    Fulfilled(&'a Value),
    Rejected(&'a Rejection),
}

enum Slot<C> {
    Deferred(Vec<Reaction<C>>),
    Forwarded(PromiseId),
    Settled(Settled),
}

pub struct Promises<C> {
    slots: Vec<Slot<C>>,
}

fn unknown_promise() -> Rejection {
    Rejection::BadSyntax {
        reason: "unknown promise".into(),
    }
}

impl<C: 'static> Promises<C> {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn defer(&mut self) -> (PromiseId, Resolver) {
        let promise = PromiseId(self.slots.len());
        self.slots.push(Slot::Deferred(Vec::new()));
        (promise, Resolver { promise })
    }

    /// Wraps an immediate value. Non-finite numbers give a rejected promise
    /// and a promise reference is returned as is.
    pub fn fulfilled(&mut self, value: Value) -> PromiseId {
        if let Value::Ref(Ref::Promise(p)) = value {
            return p;
        }
        let settled = if value.is_finite() {
            Ok(value)
        } else {
            Err(Rejection::Arithmetic)
        };
        let promise = PromiseId(self.slots.len());
        self.slots.push(Slot::Settled(settled));
        promise
    }

    pub fn rejected(&mut self, reason: Rejection) -> PromiseId {
        let promise = PromiseId(self.slots.len());
        self.slots.push(Slot::Settled(Err(reason)));
        promise
    }

    /// Follows forwarding links to the slot that holds the state.
    pub fn root(&self, id: PromiseId) -> PromiseId {
        let mut current = id;
        for _ in 0..=self.slots.len() {
            match self.slots.get(current.0) {
                Some(Slot::Forwarded(next)) => current = *next,
                _ => return current,
            }
        }
        current
    }

    pub fn settled(&self, id: PromiseId) -> Option<&Settled> {
        match self.slots.get(self.root(id).0) {
            Some(Slot::Settled(settled)) => Some(settled),
            _ => None,
        }
    }

    pub fn state(&self, id: PromiseId) -> State<'_> {
        match self.settled(id) {
            None => State::Deferred,
            Some(Ok(value)) => State::Fulfilled(value),
            Some(Err(reason)) => State::Rejected(reason),
        }
    }

    pub fn is_deferred(&self, id: PromiseId) -> bool {
        matches!(self.slots.get(self.root(id).0), Some(Slot::Deferred(_)))
    }

    /// Fulfills with `value`; a promise reference forwards instead.
    pub fn run(&mut self, resolver: Resolver, value: Value, turns: &mut TurnQueue<C>) -> bool {
        self.settle(resolver, Ok(value), turns)
    }

    pub fn reject(
        &mut self,
        resolver: Resolver,
        reason: Rejection,
        turns: &mut TurnQueue<C>,
    ) -> bool {
        self.complete(resolver.promise, Err(reason), turns)
    }

    pub fn settle(&mut self, resolver: Resolver, settled: Settled, turns: &mut TurnQueue<C>) -> bool {
        match settled {
            Ok(Value::Ref(Ref::Promise(target))) => self.resolve(resolver, target, turns),
            Ok(value) if !value.is_finite() => {
                self.complete(resolver.promise, Err(Rejection::Arithmetic), turns)
            }
            other => self.complete(resolver.promise, other, turns),
        }
    }

    /// Forwards the resolver's promise to `target`.
    ///
    /// A chain that leads back to the resolver's own slot rejects it with
    /// [`Rejection::Cycle`].
    pub fn resolve(
        &mut self,
        resolver: Resolver,
        target: PromiseId,
        turns: &mut TurnQueue<C>,
    ) -> bool {
        let own = resolver.promise;
        if !matches!(self.slots.get(own.0), Some(Slot::Deferred(_))) {
            return false;
        }
        let target = self.root(target);
        if target == own {
            return self.complete(own, Err(Rejection::Cycle), turns);
        }
        match self.slots.get(target.0) {
            Some(Slot::Settled(settled)) => {
                let settled = settled.clone();
                self.complete(own, settled, turns)
            }
            Some(Slot::Deferred(_)) => {
                let moved = match self.slots.get_mut(own.0) {
                    Some(slot) => std::mem::replace(slot, Slot::Forwarded(target)),
                    None => return false,
                };
                if let (Slot::Deferred(reactions), Some(Slot::Deferred(waiting))) =
                    (moved, self.slots.get_mut(target.0))
                {
                    waiting.extend(reactions);
                }
                true
            }
            _ => self.complete(own, Err(unknown_promise()), turns),
        }
    }

    /// Registers a reaction; it runs in a later turn, even if already settled.
    pub fn when(&mut self, id: PromiseId, reaction: Reaction<C>, turns: &mut TurnQueue<C>) {
        let root = self.root(id);
        match self.slots.get_mut(root.0) {
            Some(Slot::Deferred(waiting)) => waiting.push(reaction),
            Some(Slot::Settled(settled)) => {
                let settled = settled.clone();
                turns.push(Box::new(move |ctx| reaction(ctx, settled)));
            }
            _ => turns.push(Box::new(move |ctx| reaction(ctx, Err(unknown_promise())))),
        }
    }

    /// Fulfilled and rejected promises compare by content; deferred ones by slot.
    pub fn same(&self, a: PromiseId, b: PromiseId) -> bool {
        let (a, b) = (self.root(a), self.root(b));
        if a == b {
            return true;
        }
        match (self.settled(a), self.settled(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    fn complete(&mut self, id: PromiseId, settled: Settled, turns: &mut TurnQueue<C>) -> bool {
        let Some(slot) = self.slots.get_mut(id.0) else {
            return false;
        };
        let Slot::Deferred(waiting) = &mut *slot else {
            return false;
        };
        let reactions = std::mem::take(waiting);
        *slot = Slot::Settled(settled.clone());
        for reaction in reactions {
            let settled = settled.clone();
            turns.push(Box::new(move |ctx| reaction(ctx, settled)));
        }
        true
    }
}

impl<C: 'static> Default for Promises<C> {
    fn default() -> Self {
        Self::new()
    }
}
