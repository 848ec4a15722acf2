//! The stream parser (component C3).
//!
//! Consumes an abstract LLM event stream ([`LlmEvent`]) and emits a derived
//! sequence of [`ParsedEvent`]s plus a terminal [`StreamOutcome`]. Two
//! parallel extraction paths feed the same output: structured tool-calls the
//! provider emits natively pass through verbatim, while inline tool-calls
//! encoded as `<tool_name><param>value</param></tool_name>` in free text are
//! recovered by [`tag_grammar::TagGrammarParser`], an explicit
//! character-level state machine (no backtracking, no regex).

use serde_json::Value;

use crate::usage::Usage;

/// A single event from the abstract LLM port's stream.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum LlmEvent {
    /// Incremental assistant text.
    TextDelta(String),
    /// Incremental reasoning/thinking content (not shown as assistant text).
    ReasoningDelta(String),
    /// A natively structured tool call the provider emitted directly
    /// (as opposed to one embedded in free text via the tag grammar).
    ToolCallStructured {
        /// Provider-assigned id, if any; the parser generates one if absent.
        id: Option<String>,
        /// Tool name.
        name: String,
        /// Tool input.
        input: Value,
    },
    /// The stream has ended.
    End {
        /// Provider-assigned message id.
        message_id: Option<String>,
        /// Token usage for the completed message, if reported.
        usage: Option<Usage>,
    },
}

/// A derived event emitted by the stream parser.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEvent {
    /// Plain assistant text. Ordering guarantee: every text chunk precedes
    /// any tool-call whose opening tag began after it.
    Text(String),
    /// Reasoning content, passed through unchanged.
    Reasoning(String),
    /// A tool call, in source order, from either extraction path.
    ToolCall {
        /// Process-unique id.
        id: String,
        /// Tool name.
        name: String,
        /// Tool input.
        input: Value,
        /// Where the call came from.
        source: ToolCallSource,
    },
}

/// Which extraction path produced a [`ParsedEvent::ToolCall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallSource {
    /// The provider emitted a structured tool-call event.
    Structured,
    /// Recovered from the `<tool_name>...</tool_name>` tag grammar in free
    /// text.
    Inline,
}

/// The terminal value of a parse: either the message completed normally or
/// the parse was cut short by an abort.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    /// The stream ended normally.
    Completed {
        /// Provider-assigned message id, if any.
        message_id: Option<String>,
        /// Token usage for the completed message, if reported.
        usage: Option<Usage>,
    },
    /// The parse was cancelled; any partial tag was discarded.
    Aborted,
}

/// Consumes [`LlmEvent`]s and produces [`ParsedEvent`]s plus a terminal
/// [`StreamOutcome`].
///
/// Holds no I/O of its own - it is fed events and an id generator by the
/// caller (the step runner), which lets it stay synchronous and trivially
/// testable.
pub struct StreamParser<'a> {
    tags: tag_grammar::TagGrammarParser,
    id_gen: &'a (dyn Fn() -> String + Sync),
}

impl std::fmt::Debug for StreamParser<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamParser")
            .field("tags", &self.tags)
            .field("id_gen", &"<fn>")
            .finish()
    }
}

impl<'a> StreamParser<'a> {
    /// Create a parser that uses `id_gen` to mint ids for tool calls that
    /// arrive without one (inline calls, and structured calls whose
    /// provider omitted an id).
    #[must_use]
    pub fn new(id_gen: &'a (dyn Fn() -> String + Sync)) -> Self {
        Self {
            tags: tag_grammar::TagGrammarParser::new(),
            id_gen,
        }
    }

    /// Feed one upstream event, returning the [`ParsedEvent`]s it produces.
    ///
    /// Returns `Ok(events)` for non-terminal events, or `Err(outcome)` once
    /// `LlmEvent::End` is observed (the caller should stop feeding after
    /// that).
    pub fn feed(&mut self, event: LlmEvent) -> FeedResult {
        match event {
            LlmEvent::TextDelta(text) => {
                let mut events = Vec::new();
                for frame in self.tags.feed(&text) {
                    events.push(frame.into_parsed_event(self.id_gen));
                }
                FeedResult::Events(events)
            }
            LlmEvent::ReasoningDelta(text) => FeedResult::Events(vec![ParsedEvent::Reasoning(text)]),
            LlmEvent::ToolCallStructured { id, name, input } => {
                FeedResult::Events(vec![ParsedEvent::ToolCall {
                    id: id.unwrap_or_else(|| (self.id_gen)()),
                    name,
                    input,
                    source: ToolCallSource::Structured,
                }])
            }
            LlmEvent::End { message_id, usage } => {
                // Any partial tag at stream end is discarded.
                let mut events: Vec<ParsedEvent> = Vec::new();
                for frame in self.tags.finish() {
                    events.push(frame.into_parsed_event(self.id_gen));
                }
                FeedResult::Terminal(events, StreamOutcome::Completed { message_id, usage })
            }
        }
    }

    /// Abort the parse. Drains cheaply: any partial tag is discarded and no
    /// further events are emitted for already-buffered-but-incomplete
    /// input.
    pub fn abort(&mut self) -> StreamOutcome {
        self.tags.reset();
        StreamOutcome::Aborted
    }
}

/// The result of feeding one event into the parser.
#[derive(Debug)]
pub enum FeedResult {
    /// More events may follow.
    Events(Vec<ParsedEvent>),
    /// The stream ended; these are the final events (if any) plus the
    /// terminal outcome.
    Terminal(Vec<ParsedEvent>, StreamOutcome),
}

/// The inline tag-grammar extractor: an explicit character-level state
/// machine over `<tool_name><param_name>value</param_name></tool_name>`.
pub mod tag_grammar {
    use serde_json::Value;

    use super::{ParsedEvent, ToolCallSource};

    /// One completed unit of output from the tag grammar: either a run of
    /// plain text, or a fully parsed tool call.
    #[derive(Debug, Clone, PartialEq)]
    pub(super) enum Frame {
        Text(String),
        ToolCall { name: String, input: Value },
    }

    impl Frame {
        pub(super) fn into_parsed_event(self, id_gen: &(dyn Fn() -> String + Sync)) -> ParsedEvent {
            match self {
                Self::Text(text) => ParsedEvent::Text(text),
                Self::ToolCall { name, input } => ParsedEvent::ToolCall {
                    id: id_gen(),
                    name,
                    input,
                    source: ToolCallSource::Inline,
                },
            }
        }
    }

    /// FSM states, named per the design notes: `TEXT`, `IN_TAG_NAME`,
    /// `IN_PARAM`, `IN_PARAM_VALUE`, `IN_CLOSE`.
    #[derive(Debug, Clone, PartialEq)]
    enum State {
        /// Outside any tag.
        Text,
        /// Buffering characters after `<`, deciding whether this opens a
        /// valid `[a-z][a-z0-9_]*` tool tag.
        InTagName { buf: String },
        /// Inside `<tool_name> ... </tool_name>`, not currently inside a
        /// param. `closing` buffers a `<` seen here until we know whether it
        /// starts a param tag or the tool's closing tag.
        InTool { tool: String, params: Vec<(String, String)> },
        /// Buffering a `<` seen while `InTool`, to distinguish
        /// `<param_name>` from `</tool_name>`.
        InTagOrClose {
            tool: String,
            params: Vec<(String, String)>,
            buf: String,
        },
        /// Inside `<param_name> value`, accumulating the value until we see
        /// `</param_name>`.
        InParamValue {
            tool: String,
            params: Vec<(String, String)>,
            param: String,
            value: String,
            closing: String,
        },
    }

    /// Parses a character stream incrementally, one text delta at a time.
    #[derive(Debug)]
    pub struct TagGrammarParser {
        state: State,
    }

    impl Default for TagGrammarParser {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TagGrammarParser {
        /// Create a parser starting in the `TEXT` state.
        #[must_use]
        pub const fn new() -> Self {
            Self { state: State::Text }
        }

        /// Discard any partial tag and return to `TEXT`.
        pub fn reset(&mut self) {
            self.state = State::Text;
        }

        /// Feed one chunk of text, returning completed frames in order.
        pub(super) fn feed(&mut self, chunk: &str) -> Vec<Frame> {
            let mut out = Vec::new();
            let mut text_buf = String::new();
            for ch in chunk.chars() {
                self.step(ch, &mut out, &mut text_buf);
            }
            if !text_buf.is_empty() {
                out.push(Frame::Text(std::mem::take(&mut text_buf)));
            }
            out
        }

        /// Called at stream end: discard any partial tag and emit nothing
        /// further for it.
        pub(super) fn finish(&mut self) -> Vec<Frame> {
            self.state = State::Text;
            Vec::new()
        }

        #[allow(clippy::too_many_lines)]
        fn step(&mut self, ch: char, out: &mut Vec<Frame>, text_buf: &mut String) {
            match std::mem::replace(&mut self.state, State::Text) {
                State::Text => {
                    if ch == '<' {
                        if !text_buf.is_empty() {
                            out.push(Frame::Text(std::mem::take(text_buf)));
                        }
                        self.state = State::InTagName { buf: String::new() };
                    } else {
                        text_buf.push(ch);
                        self.state = State::Text;
                    }
                }
                State::InTagName { mut buf } => {
                    if ch == '>' && is_tag_name(&buf) {
                        self.state = State::InTool { tool: buf, params: Vec::new() };
                    } else if is_tag_name_char(ch, buf.is_empty()) {
                        buf.push(ch);
                        self.state = State::InTagName { buf };
                    } else {
                        // Not a valid tag: flush the literal `<` + buffer as
                        // text and reprocess `ch` from TEXT.
                        text_buf.push('<');
                        text_buf.push_str(&buf);
                        self.state = State::Text;
                        self.step(ch, out, text_buf);
                    }
                }
                State::InTool { tool, params } => {
                    if ch == '<' {
                        self.state = State::InTagOrClose {
                            tool,
                            params,
                            buf: String::new(),
                        };
                    } else {
                        // Stray text directly inside a tool body (outside
                        // any param) carries no meaning in this grammar;
                        // drop it.
                        self.state = State::InTool { tool, params };
                    }
                }
                State::InTagOrClose { tool, params, mut buf } => {
                    if ch == '/' && buf.is_empty() {
                        buf.push('/');
                        self.state = State::InTagOrClose { tool, params, buf };
                    } else if ch == '>' {
                        if let Some(name) = buf.strip_prefix('/') {
                            if name == tool {
                                out.push(Frame::ToolCall {
                                    name: tool,
                                    input: params_to_value(params),
                                });
                                self.state = State::Text;
                            } else {
                                // Closing tag for something else; ignore and
                                // keep collecting the tool body.
                                self.state = State::InTool { tool, params };
                            }
                        } else if is_tag_name(&buf) {
                            self.state = State::InParamValue {
                                tool,
                                params,
                                param: buf,
                                value: String::new(),
                                closing: String::new(),
                            };
                        } else {
                            self.state = State::InTool { tool, params };
                        }
                    } else if is_tag_name_char(ch, buf.is_empty() || buf == "/") {
                        buf.push(ch);
                        self.state = State::InTagOrClose { tool, params, buf };
                    } else {
                        // Malformed; abandon this angle bracket and resume
                        // the tool body.
                        self.state = State::InTool { tool, params };
                    }
                }
                State::InParamValue {
                    tool,
                    mut params,
                    param,
                    mut value,
                    mut closing,
                } => {
                    if !closing.is_empty() || ch == '<' {
                        closing.push(ch);
                        let expected = format!("</{param}>");
                        if closing == expected {
                            params.push((param, value));
                            self.state = State::InTool { tool, params };
                        } else if expected.starts_with(&closing) {
                            self.state = State::InParamValue {
                                tool,
                                params,
                                param,
                                value,
                                closing,
                            };
                        } else {
                            // False alarm: the `<...` we buffered wasn't the
                            // closing tag. Treat it as literal value content.
                            value.push_str(&closing);
                            self.state = State::InParamValue {
                                tool,
                                params,
                                param,
                                value,
                                closing: String::new(),
                            };
                        }
                    } else {
                        value.push(ch);
                        self.state = State::InParamValue {
                            tool,
                            params,
                            param,
                            value,
                            closing,
                        };
                    }
                }
            }
        }
    }

    fn is_tag_name_char(ch: char, is_first: bool) -> bool {
        if is_first {
            ch.is_ascii_lowercase()
        } else {
            ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_'
        }
    }

    fn is_tag_name(s: &str) -> bool {
        let mut chars = s.chars();
        match chars.next() {
            Some(c) if c.is_ascii_lowercase() => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }

    fn params_to_value(params: Vec<(String, String)>) -> Value {
        let mut map = serde_json::Map::with_capacity(params.len());
        for (k, v) in params {
            map.insert(k, Value::String(v));
        }
        Value::Object(map)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn run(chunks: &[&str]) -> Vec<Frame> {
            let mut parser = TagGrammarParser::new();
            let mut out = Vec::new();
            for chunk in chunks {
                out.extend(parser.feed(chunk));
            }
            out.extend(parser.finish());
            out
        }

        #[test]
        fn plain_text_passes_through() {
            let frames = run(&["hello world"]);
            assert_eq!(frames, vec![Frame::Text("hello world".into())]);
        }

        #[test]
        fn parses_a_single_tool_call() {
            let frames = run(&["before <read_files><path>a.ts</path></read_files> after"]);
            assert_eq!(
                frames,
                vec![
                    Frame::Text("before ".into()),
                    Frame::ToolCall {
                        name: "read_files".into(),
                        input: serde_json::json!({"path": "a.ts"}),
                    },
                    Frame::Text(" after".into()),
                ]
            );
        }

        #[test]
        fn splits_a_tag_across_chunks() {
            let frames = run(&["<read_", "files><path>a.t", "s</path></read_files>"]);
            assert_eq!(
                frames,
                vec![Frame::ToolCall {
                    name: "read_files".into(),
                    input: serde_json::json!({"path": "a.ts"}),
                }]
            );
        }

        #[test]
        fn unclosed_tag_at_stream_end_is_discarded() {
            let frames = run(&["before <read_files><path>a.ts"]);
            assert_eq!(frames, vec![Frame::Text("before ".into())]);
        }

        #[test]
        fn multiple_params_in_order() {
            let frames = run(&["<edit><path>a.ts</path><content>x</content></edit>"]);
            assert_eq!(
                frames,
                vec![Frame::ToolCall {
                    name: "edit".into(),
                    input: serde_json::json!({"path": "a.ts", "content": "x"}),
                }]
            );
        }

        #[test]
        fn less_than_not_forming_a_tag_is_literal_text() {
            let frames = run(&["if a < 3 and b>2 then go"]);
            assert_eq!(frames, vec![Frame::Text("if a < 3 and b>2 then go".into())]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_tool_call_passes_through_verbatim() {
        let counter = std::sync::atomic::AtomicU32::new(0);
        let id_gen = || {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            format!("gen_{n}")
        };
        let mut parser = StreamParser::new(&id_gen);
        let result = parser.feed(LlmEvent::ToolCallStructured {
            id: Some("native_1".into()),
            name: "read_files".into(),
            input: serde_json::json!({"paths": ["a.ts"]}),
        });
        match result {
            FeedResult::Events(events) => {
                assert_eq!(events.len(), 1);
                assert!(matches!(
                    &events[0],
                    ParsedEvent::ToolCall { id, source: ToolCallSource::Structured, .. }
                        if id == "native_1"
                ));
            }
            FeedResult::Terminal(..) => panic!("expected non-terminal result"),
        }
    }

    #[test]
    fn inline_tool_call_gets_generated_id() {
        let counter = std::sync::atomic::AtomicU32::new(0);
        let id_gen = || {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            format!("gen_{n}")
        };
        let mut parser = StreamParser::new(&id_gen);
        let FeedResult::Events(events) =
            parser.feed(LlmEvent::TextDelta("<end_turn></end_turn>".into()))
        else {
            panic!("expected non-terminal result");
        };
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ParsedEvent::ToolCall { id, .. } if id == "gen_0"));
    }

    #[test]
    fn end_event_flushes_partial_tag_as_discarded() {
        let id_gen = || "gen".to_string();
        let mut parser = StreamParser::new(&id_gen);
        let _ = parser.feed(LlmEvent::TextDelta("ok: <read_files><path>a".into()));
        let result = parser.feed(LlmEvent::End {
            message_id: Some("msg_1".into()),
            usage: None,
        });
        match result {
            FeedResult::Terminal(events, outcome) => {
                assert!(events.is_empty());
                assert_eq!(
                    outcome,
                    StreamOutcome::Completed {
                        message_id: Some("msg_1".into()),
                        usage: None
                    }
                );
            }
            FeedResult::Events(_) => panic!("expected terminal result"),
        }
    }
}
