use log::debug;

use crate::error::FrameError;

/// Line the device emits between frames.
const SENTINEL: &str = "\0";

/// Elements longer than this are assumed to have lost their close tag.
pub const MAX_ELEMENT_LINES: usize = 64;

/// Element kinds the assembler tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    InstantaneousDemand,
    CurrentSummationDelivered,
}

impl ElementKind {
    pub const ALL: [ElementKind; 2] = [
        ElementKind::InstantaneousDemand,
        ElementKind::CurrentSummationDelivered,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ElementKind::InstantaneousDemand => "InstantaneousDemand",
            ElementKind::CurrentSummationDelivered => "CurrentSummationDelivered",
        }
    }

    pub fn open_tag(self) -> &'static str {
        match self {
            ElementKind::InstantaneousDemand => "<InstantaneousDemand>",
            ElementKind::CurrentSummationDelivered => "<CurrentSummationDelivered>",
        }
    }

    pub fn close_tag(self) -> &'static str {
        match self {
            ElementKind::InstantaneousDemand => "</InstantaneousDemand>",
            ElementKind::CurrentSummationDelivered => "</CurrentSummationDelivered>",
        }
    }

    fn from_open_tag(line: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.open_tag() == line)
    }
}

/// A complete frame, open tag through close tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub kind: ElementKind,
    pub text: String,
}

#[derive(Debug)]
enum State {
    Idle,
    InElement {
        kind: ElementKind,
        text: String,
        lines: usize,
    },
}

/// Reassembles device frames from a stream of lines.
#[derive(Debug)]
pub struct FrameAssembler {
    state: State,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    /// True while part of an element has been buffered.
    pub fn in_element(&self) -> bool {
        matches!(self.state, State::InElement { .. })
    }

    /// Feed one line. Returns the element it completes, if any.
    pub fn push(&mut self, line: &str) -> Result<Option<Element>, FrameError> {
        let trimmed = line.trim();
        if trimmed == SENTINEL {
            debug!("Skipping mark");
            return Ok(None);
        }

        match &mut self.state {
            State::Idle => {
                if let Some(kind) = ElementKind::from_open_tag(trimmed) {
                    debug!("Start of <{}>", kind.name());
                    self.state = State::InElement {
                        kind,
                        text: line.to_string(),
                        lines: 1,
                    };
                }
                Ok(None)
            }
            State::InElement { kind, text, lines } => {
                let kind = *kind;
                text.push_str(line);
                *lines += 1;

                if trimmed == kind.close_tag() {
                    let text = std::mem::take(text);
                    self.state = State::Idle;
                    debug!("End of <{}>", kind.name());
                    return Ok(Some(Element { kind, text }));
                }

                if *lines > MAX_ELEMENT_LINES {
                    let lines = *lines;
                    self.state = State::Idle;
                    return Err(FrameError::Overrun {
                        tag: kind.name(),
                        lines,
                    });
                }
                Ok(None)
            }
        }
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}
