//! Token stream roles and the ordered stream bundle
//!
//! Every block call works on up to four token streams. They are always
//! concatenated, masked and split in the same order:
//!
//! ```text
//! context -> main -> primary condition -> extra condition
//! ```
//!
//! [`Streams`] carries one value per present stream (hidden states, timestep
//! embeddings, rotary tables, block results) and iterates in that order, so
//! callers never branch on which optional streams were supplied.
//! [`StreamLayout`] records where each stream lives inside the concatenated
//! sequence.

use std::fmt;
use std::ops::Range;

use burn::prelude::*;

/// Which of the two condition streams a token stream is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionSlot {
    Primary,
    Extra,
}

/// Role of a token stream within a block call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    /// Text tokens, with their own projection weights
    Context,
    /// Noisy image latent tokens
    Main,
    /// Reference tokens sharing the main stream's weights
    Condition(ConditionSlot),
}

impl StreamRole {
    /// Concatenation order of all roles
    pub const ORDER: [StreamRole; 4] = [
        StreamRole::Context,
        StreamRole::Main,
        StreamRole::Condition(ConditionSlot::Primary),
        StreamRole::Condition(ConditionSlot::Extra),
    ];

    pub fn is_condition(self) -> bool {
        matches!(self, StreamRole::Condition(_))
    }

    pub fn name(self) -> &'static str {
        match self {
            StreamRole::Context => "context",
            StreamRole::Main => "main",
            StreamRole::Condition(ConditionSlot::Primary) => "condition",
            StreamRole::Condition(ConditionSlot::Extra) => "extra condition",
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One value per present stream, addressed by role
///
/// `main` is always present. The other streams are optional and independent
/// of each other: an extra condition may be given without a primary one.
#[derive(Debug, Clone, PartialEq)]
pub struct Streams<T> {
    pub context: Option<T>,
    pub main: T,
    pub condition: Option<T>,
    pub extra_condition: Option<T>,
}

impl<T> Streams<T> {
    /// A bundle holding only the main stream
    pub fn new(main: T) -> Self {
        Self {
            context: None,
            main,
            condition: None,
            extra_condition: None,
        }
    }

    pub fn with_context(mut self, context: T) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_condition(mut self, condition: T) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_extra_condition(mut self, extra_condition: T) -> Self {
        self.extra_condition = Some(extra_condition);
        self
    }

    /// Value for `role`, if that stream is present
    pub fn get(&self, role: StreamRole) -> Option<&T> {
        match role {
            StreamRole::Context => self.context.as_ref(),
            StreamRole::Main => Some(&self.main),
            StreamRole::Condition(ConditionSlot::Primary) => self.condition.as_ref(),
            StreamRole::Condition(ConditionSlot::Extra) => self.extra_condition.as_ref(),
        }
    }

    /// Whether any condition stream is present
    pub fn has_condition(&self) -> bool {
        self.condition.is_some() || self.extra_condition.is_some()
    }

    /// Number of present streams
    pub fn count(&self) -> usize {
        self.iter().count()
    }

    /// Present roles in concatenation order
    pub fn roles(&self) -> Vec<StreamRole> {
        self.iter().map(|(role, _)| role).collect()
    }

    /// Present streams in concatenation order
    pub fn iter(&self) -> impl Iterator<Item = (StreamRole, &T)> {
        StreamRole::ORDER
            .into_iter()
            .filter_map(move |role| self.get(role).map(|value| (role, value)))
    }

    /// Consumes the bundle into `(role, value)` pairs in concatenation order
    pub fn into_ordered(self) -> Vec<(StreamRole, T)> {
        let mut ordered = Vec::with_capacity(4);
        if let Some(context) = self.context {
            ordered.push((StreamRole::Context, context));
        }
        ordered.push((StreamRole::Main, self.main));
        if let Some(condition) = self.condition {
            ordered.push((StreamRole::Condition(ConditionSlot::Primary), condition));
        }
        if let Some(extra) = self.extra_condition {
            ordered.push((StreamRole::Condition(ConditionSlot::Extra), extra));
        }
        ordered
    }

    pub fn as_ref(&self) -> Streams<&T> {
        Streams {
            context: self.context.as_ref(),
            main: &self.main,
            condition: self.condition.as_ref(),
            extra_condition: self.extra_condition.as_ref(),
        }
    }

    /// Applies `f` to every present stream, in concatenation order
    pub fn map<U>(self, mut f: impl FnMut(StreamRole, T) -> U) -> Streams<U> {
        let context = self.context.map(|x| f(StreamRole::Context, x));
        let main = f(StreamRole::Main, self.main);
        let condition = self
            .condition
            .map(|x| f(StreamRole::Condition(ConditionSlot::Primary), x));
        let extra_condition = self
            .extra_condition
            .map(|x| f(StreamRole::Condition(ConditionSlot::Extra), x));
        Streams {
            context,
            main,
            condition,
            extra_condition,
        }
    }

    /// Fallible [`Self::map`]; stops at the first error
    pub fn try_map<U, E>(
        self,
        mut f: impl FnMut(StreamRole, T) -> Result<U, E>,
    ) -> Result<Streams<U>, E> {
        let context = self.context.map(|x| f(StreamRole::Context, x)).transpose()?;
        let main = f(StreamRole::Main, self.main)?;
        let condition = self
            .condition
            .map(|x| f(StreamRole::Condition(ConditionSlot::Primary), x))
            .transpose()?;
        let extra_condition = self
            .extra_condition
            .map(|x| f(StreamRole::Condition(ConditionSlot::Extra), x))
            .transpose()?;
        Ok(Streams {
            context,
            main,
            condition,
            extra_condition,
        })
    }
}

impl<T> Streams<T> {
    /// Pairs values role by role
    ///
    /// Optional streams present in only one of the two bundles are dropped.
    pub fn zip<U>(self, other: Streams<U>) -> Streams<(T, U)> {
        Streams {
            context: self.context.zip(other.context),
            main: (self.main, other.main),
            condition: self.condition.zip(other.condition),
            extra_condition: self.extra_condition.zip(other.extra_condition),
        }
    }
}

/// Position of each stream inside the concatenated sequence axis
#[derive(Debug, Clone, PartialEq)]
pub struct StreamLayout {
    ranges: Streams<Range<usize>>,
    total: usize,
}

impl StreamLayout {
    /// Lays out streams of the given lengths in concatenation order
    pub fn new(lengths: &Streams<usize>) -> Self {
        let mut offset = 0;
        let ranges = lengths.as_ref().map(|_, &len| {
            let range = offset..offset + len;
            offset += len;
            range
        });
        Self {
            ranges,
            total: offset,
        }
    }

    /// Layout of `[batch, seq, channels]` token streams
    pub fn of<B: Backend>(streams: &Streams<Tensor<B, 3>>) -> Self {
        Self::new(&streams.as_ref().map(|_, x| x.dims()[1]))
    }

    /// Length of the concatenated sequence
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn range(&self, role: StreamRole) -> Option<Range<usize>> {
        self.ranges.get(role).cloned()
    }

    pub fn lengths(&self) -> Streams<usize> {
        self.ranges.clone().map(|_, range| range.len())
    }

    /// Tokens belonging to non-condition streams (context and main)
    ///
    /// Conditions are concatenated last, so these always form a prefix.
    pub fn non_condition_len(&self) -> usize {
        self.ranges.main.end
    }

    /// Whether the layout contains any condition tokens
    pub fn has_condition(&self) -> bool {
        self.total > self.non_condition_len()
    }

    /// Splits a concatenated `[batch, seq, channels]` tensor back into streams
    pub fn split<B: Backend>(&self, x: Tensor<B, 3>) -> Streams<Tensor<B, 3>> {
        debug_assert_eq!(x.dims()[1], self.total);
        self.ranges
            .clone()
            .map(|_, range| x.clone().narrow(1, range.start, range.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_iteration_follows_fixed_order() {
        let streams = Streams::new("main")
            .with_extra_condition("extra")
            .with_condition("cond")
            .with_context("ctx");

        let order: Vec<&str> = streams.iter().map(|(_, name)| *name).collect();
        assert_eq!(order, vec!["ctx", "main", "cond", "extra"]);
        assert_eq!(streams.roles(), StreamRole::ORDER.to_vec());
    }

    #[test]
    fn test_extra_condition_is_independent() {
        let streams = Streams::new(1).with_extra_condition(2);
        assert!(streams.has_condition());
        assert_eq!(
            streams.roles(),
            vec![StreamRole::Main, StreamRole::Condition(ConditionSlot::Extra)]
        );
    }

    #[test]
    fn test_try_map_stops_at_first_error() {
        let streams = Streams::new(1).with_context(0).with_condition(2);
        let mut seen = Vec::new();
        let result: Result<Streams<i32>, StreamRole> = streams.try_map(|role, x| {
            seen.push(role);
            if role == StreamRole::Main {
                Err(role)
            } else {
                Ok(x)
            }
        });

        assert_eq!(result, Err(StreamRole::Main));
        assert_eq!(seen, vec![StreamRole::Context, StreamRole::Main]);
    }

    #[test]
    fn test_layout_ranges() {
        let lengths = Streams::new(16).with_context(4).with_condition(16).with_extra_condition(8);
        let layout = StreamLayout::new(&lengths);

        assert_eq!(layout.total(), 44);
        assert_eq!(layout.range(StreamRole::Context), Some(0..4));
        assert_eq!(layout.range(StreamRole::Main), Some(4..20));
        assert_eq!(layout.range(StreamRole::Condition(ConditionSlot::Primary)), Some(20..36));
        assert_eq!(layout.range(StreamRole::Condition(ConditionSlot::Extra)), Some(36..44));
        assert_eq!(layout.non_condition_len(), 20);
        assert_eq!(layout.lengths(), lengths);
    }

    #[test]
    fn test_split_recovers_streams() {
        let device = Default::default();
        let main = Tensor::<TestBackend, 3>::ones([1, 3, 2], &device);
        let cond = Tensor::<TestBackend, 3>::ones([1, 2, 2], &device) * 2.0;
        let streams = Streams::new(main).with_condition(cond);
        let layout = StreamLayout::of(&streams);

        let joined = Tensor::cat(streams.into_ordered().into_iter().map(|(_, x)| x).collect(), 1);
        let split = layout.split(joined);

        assert_eq!(split.main.dims(), [1, 3, 2]);
        let cond: Vec<f32> = split.condition.unwrap().into_data().to_vec().unwrap();
        assert!(cond.iter().all(|&x| x == 2.0));
        assert!(split.context.is_none());
    }
}
