//! Merged Iterators
//!
//! Combines N journal iterators into one time-ordered stream. The merge is
//! a balanced binary tournament of 2-way [`Mixer`]s: adjacent sources are
//! paired, then pairs of mixers are paired, until a single root remains.
//! Each `get` peeks both children and emits the comparator's winner; `next`
//! advances only the winner. That gives `O(log N)` comparisons per record.
//!
//! A child reporting end-of-data degrades the mixer to a passthrough of
//! the other child - but the EOFd side is re-asked on every call, so a
//! journal that receives new records after its EOF re-enters the merge
//! immediately. Cancellation from either child propagates as-is.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use loghouse_core::{Error, LogEvent, Result, TagLine};

/// One record stamped with the tag line of its source journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub event: LogEvent,
    pub tag: TagLine,
}

/// A peekable, advanceable stream of tagged events.
#[async_trait]
pub trait EventSource: Send {
    /// Returns the current record without advancing.
    async fn get(&mut self, ctx: &CancellationToken) -> Result<TaggedEvent>;

    /// Advances one record.
    async fn next(&mut self, ctx: &CancellationToken);
}

/// Comparator: returns true when `a` should be emitted before `b`.
pub type CmpFn = fn(&TaggedEvent, &TaggedEvent) -> bool;

/// Forward time order: smaller timestamp first, ties broken by the smaller
/// tag line. Equal keys prefer the left child, which keeps the tournament
/// deterministic.
pub fn earliest(a: &TaggedEvent, b: &TaggedEvent) -> bool {
    (a.event.ts, &a.tag) <= (b.event.ts, &b.tag)
}

/// Reverse time order, for tail-first scans.
pub fn latest(a: &TaggedEvent, b: &TaggedEvent) -> bool {
    (a.event.ts, &a.tag) >= (b.event.ts, &b.tag)
}

/// Two-way merge node.
pub struct Mixer {
    cmp: CmpFn,
    left: Box<dyn EventSource>,
    right: Box<dyn EventSource>,
}

impl Mixer {
    pub fn new(cmp: CmpFn, left: Box<dyn EventSource>, right: Box<dyn EventSource>) -> Self {
        Self { cmp, left, right }
    }

    /// Peeks both children. `Ok(true)` means the left child wins.
    async fn select(&mut self, ctx: &CancellationToken) -> Result<(bool, TaggedEvent)> {
        let left = match self.left.get(ctx).await {
            Ok(ev) => Some(ev),
            Err(e) if e.is_eof() => None,
            Err(e) => return Err(e),
        };
        let right = match self.right.get(ctx).await {
            Ok(ev) => Some(ev),
            Err(e) if e.is_eof() => None,
            Err(e) => return Err(e),
        };
        match (left, right) {
            (Some(l), Some(r)) => {
                if (self.cmp)(&l, &r) {
                    Ok((true, l))
                } else {
                    Ok((false, r))
                }
            }
            (Some(l), None) => Ok((true, l)),
            (None, Some(r)) => Ok((false, r)),
            (None, None) => Err(Error::Eof),
        }
    }
}

#[async_trait]
impl EventSource for Mixer {
    async fn get(&mut self, ctx: &CancellationToken) -> Result<TaggedEvent> {
        let (_, ev) = self.select(ctx).await?;
        Ok(ev)
    }

    async fn next(&mut self, ctx: &CancellationToken) {
        match self.select(ctx).await {
            Ok((true, _)) => self.left.next(ctx).await,
            Ok((false, _)) => self.right.next(ctx).await,
            Err(_) => {}
        }
    }
}

/// Folds sources into a balanced tournament. A single source is returned
/// as-is; an odd source out is promoted a level up.
///
/// Panics on an empty input - callers resolve at least one source before
/// building the merge.
pub fn build_merge(mut sources: Vec<Box<dyn EventSource>>, cmp: CmpFn) -> Box<dyn EventSource> {
    assert!(!sources.is_empty(), "merge needs at least one source");
    while sources.len() > 1 {
        let mut level = Vec::with_capacity(sources.len() / 2 + 1);
        let mut it = sources.into_iter();
        while let Some(left) = it.next() {
            match it.next() {
                Some(right) => level.push(Box::new(Mixer::new(cmp, left, right)) as Box<dyn EventSource>),
                None => level.push(left),
            }
        }
        sources = level;
    }
    sources.pop().expect("one source remains")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory source for merge tests.
    struct VecSource {
        tag: TagLine,
        events: Vec<LogEvent>,
        at: usize,
    }

    impl VecSource {
        fn new(tag: &str, ts: &[i64]) -> Box<dyn EventSource> {
            let tag = loghouse_core::TagSet::parse(tag).unwrap().line();
            let events = ts
                .iter()
                .map(|t| LogEvent::new(*t, format!("m{}", t)))
                .collect();
            Box::new(Self {
                tag,
                events,
                at: 0,
            })
        }
    }

    #[async_trait]
    impl EventSource for VecSource {
        async fn get(&mut self, _ctx: &CancellationToken) -> Result<TaggedEvent> {
            match self.events.get(self.at) {
                Some(ev) => Ok(TaggedEvent {
                    event: ev.clone(),
                    tag: self.tag.clone(),
                }),
                None => Err(Error::Eof),
            }
        }

        async fn next(&mut self, _ctx: &CancellationToken) {
            if self.at < self.events.len() {
                self.at += 1;
            }
        }
    }

    async fn drain(src: &mut Box<dyn EventSource>) -> Vec<i64> {
        let ctx = CancellationToken::new();
        let mut out = Vec::new();
        loop {
            match src.get(&ctx).await {
                Ok(ev) => {
                    out.push(ev.event.ts);
                    src.next(&ctx).await;
                }
                Err(e) if e.is_eof() => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        out
    }

    #[tokio::test]
    async fn test_two_way_merge() {
        let mut merged = build_merge(
            vec![
                VecSource::new("name=a", &[1, 5, 9]),
                VecSource::new("name=b", &[2, 4, 6]),
            ],
            earliest,
        );
        assert_eq!(drain(&mut merged).await, vec![1, 2, 4, 5, 6, 9]);
    }

    #[tokio::test]
    async fn test_single_source_passthrough() {
        let mut merged = build_merge(vec![VecSource::new("name=a", &[3, 7])], earliest);
        assert_eq!(drain(&mut merged).await, vec![3, 7]);
    }

    #[tokio::test]
    async fn test_odd_source_count() {
        let mut merged = build_merge(
            vec![
                VecSource::new("name=a", &[1, 10]),
                VecSource::new("name=b", &[2, 11]),
                VecSource::new("name=c", &[0, 5]),
            ],
            earliest,
        );
        assert_eq!(drain(&mut merged).await, vec![0, 1, 2, 5, 10, 11]);
    }

    #[tokio::test]
    async fn test_many_sources_monotonic() {
        let sources: Vec<Box<dyn EventSource>> = (0..7)
            .map(|i| {
                let ts: Vec<i64> = (0..5).map(|j| (j * 7 + i) as i64).collect();
                VecSource::new(&format!("name=s{}", i), &ts)
            })
            .collect();
        let mut merged = build_merge(sources, earliest);
        let out = drain(&mut merged).await;
        assert_eq!(out.len(), 35);
        assert!(out.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_ties_break_on_tag_line() {
        let mut merged = build_merge(
            vec![
                VecSource::new("name=b", &[5]),
                VecSource::new("name=a", &[5]),
            ],
            earliest,
        );
        let ctx = CancellationToken::new();
        let first = merged.get(&ctx).await.unwrap();
        assert_eq!(first.tag.as_str(), "name=a");
    }

    #[tokio::test]
    async fn test_empty_side_passthrough() {
        let mut merged = build_merge(
            vec![
                VecSource::new("name=a", &[]),
                VecSource::new("name=b", &[1, 2]),
            ],
            earliest,
        );
        assert_eq!(drain(&mut merged).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_latest_comparator() {
        let mut merged = build_merge(
            vec![
                VecSource::new("name=a", &[9, 5, 1]),
                VecSource::new("name=b", &[8, 4]),
            ],
            latest,
        );
        assert_eq!(drain(&mut merged).await, vec![9, 8, 5, 4, 1]);
    }
}
