//! Incremental stop-word matching over a token stream.
//!
//! Backends feed every decoded fragment through [`StopSequences::feed`]
//! before handing it to the caller. Text that could still turn into a stop
//! word is held back, so a client never sees half of a stop word that is
//! later cut off.

/// Result of feeding one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed {
    /// Text that is safe to emit (may be empty while a prefix is held).
    Emit(String),
    /// A stop word matched. The payload is the text preceding it that has
    /// not been emitted yet; generation must end.
    Stop(String),
}

#[derive(Debug, Clone, Default)]
pub struct StopSequences {
    words: Vec<String>,
    held: String,
    stopped: bool,
}

impl StopSequences {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            words: words
                .into_iter()
                .map(|w| w.as_ref().to_owned())
                .filter(|w| !w.is_empty())
                .collect(),
            held: String::new(),
            stopped: false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn feed(&mut self, piece: &str) -> Feed {
        if self.stopped {
            return Feed::Stop(String::new());
        }
        if self.words.is_empty() {
            return Feed::Emit(piece.to_owned());
        }

        self.held.push_str(piece);

        let first_match = self
            .words
            .iter()
            .filter_map(|w| self.held.find(w.as_str()))
            .min();
        if let Some(at) = first_match {
            self.held.truncate(at);
            self.stopped = true;
            return Feed::Stop(std::mem::take(&mut self.held));
        }

        let keep = self.partial_suffix_len();
        let split = self.held.len() - keep;
        let rest = self.held.split_off(split);
        Feed::Emit(std::mem::replace(&mut self.held, rest))
    }

    /// Flush whatever is still held back once generation ends naturally.
    pub fn finish(&mut self) -> String {
        if self.stopped {
            return String::new();
        }
        std::mem::take(&mut self.held)
    }

    /// Length of the longest suffix of `held` that is a proper prefix of
    /// some stop word.
    fn partial_suffix_len(&self) -> usize {
        let longest = self.words.iter().map(|w| w.len()).max().unwrap_or(0);
        let max_keep = longest.saturating_sub(1).min(self.held.len());
        (1..=max_keep)
            .rev()
            .find(|&k| {
                let start = self.held.len() - k;
                self.held.is_char_boundary(start)
                    && self.words.iter().any(|w| w.starts_with(&self.held[start..]))
            })
            .unwrap_or(0)
    }
}
