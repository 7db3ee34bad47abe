//! Ordered per-frame work.
//!
//! Stages are registered once with an order key and run by one loop each frame.
//! Equal keys keep registration order.

use crate::util::Result;

/// One unit of per-frame work over a host context `C`.
pub trait FrameStage<C> {
    fn name(&self) -> &str;
    fn run(&mut self, cx: &mut C) -> Result<()>;
}

/// Closure-backed stage.
pub struct FnStage<F> {
    name: String,
    f: F,
}

impl<F> FnStage<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<C, F> FrameStage<C> for FnStage<F>
where
    F: FnMut(&mut C) -> Result<()>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, cx: &mut C) -> Result<()> {
        (self.f)(cx)
    }
}

struct Entry<C> {
    order: i32,
    seq: u64,
    stage: Box<dyn FrameStage<C>>,
}

pub struct FrameSchedule<C> {
    entries: Vec<Entry<C>>,
    next_seq: u64,
}

impl<C> Default for FrameSchedule<C> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
        }
    }
}

impl<C> std::fmt::Debug for FrameSchedule<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl<C> FrameSchedule<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage. Lower `order` runs first.
    pub fn add(&mut self, order: i32, stage: impl FrameStage<C> + 'static) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let at = self
            .entries
            .partition_point(|e| (e.order, e.seq) < (order, seq));
        self.entries.insert(
            at,
            Entry {
                order,
                seq,
                stage: Box::new(stage),
            },
        );
    }

    pub fn add_fn<F>(&mut self, order: i32, name: impl Into<String>, f: F)
    where
        F: FnMut(&mut C) -> Result<()> + 'static,
    {
        self.add(order, FnStage::new(name, f));
    }

    /// Remove every stage called `name`. Returns how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.stage.name() != name);
        before - self.entries.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.stage.name())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run all stages in order, stopping at the first error.
    pub fn run_frame(&mut self, cx: &mut C) -> Result<()> {
        for entry in &mut self.entries {
            let _span = tracing::debug_span!("frame_stage", name = entry.stage.name()).entered();
            if let Err(e) = entry.stage.run(cx) {
                tracing::error!(stage = entry.stage.name(), error = %e, "frame stage failed");
                return Err(e);
            }
        }
        Ok(())
    }
}
