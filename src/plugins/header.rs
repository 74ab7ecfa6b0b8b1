//! Two-state line classifier for header/license block comments.
//!
//! Lines are walked in order with a state of either `Normal` or inside a
//! block comment opened by one of the configured markers. A block opens only
//! when a trimmed line starts with an open marker, and a marker that closes on
//! the same line does not open a region (`<!-- @SPEC:AUTH-001 -->` stays a
//! normal line).

use crate::core::policy::BlockMarker;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineClass {
    Normal,
    BlockComment,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Normal,
    InBlock(usize),
}

pub fn classify_lines<'a, I>(lines: I, markers: &[BlockMarker]) -> Vec<LineClass>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut state = State::Normal;
    let mut out = Vec::new();
    for line in lines {
        let trimmed = line.trim_start();
        match state {
            State::Normal => {
                let opened = markers
                    .iter()
                    .enumerate()
                    .find(|(_, m)| trimmed.starts_with(m.open.as_str()));
                match opened {
                    Some((idx, marker)) => {
                        let rest = &trimmed[marker.open.len()..];
                        if rest.contains(marker.close.as_str()) {
                            out.push(LineClass::Normal);
                        } else {
                            state = State::InBlock(idx);
                            out.push(LineClass::BlockComment);
                        }
                    }
                    None => out.push(LineClass::Normal),
                }
            }
            State::InBlock(idx) => {
                out.push(LineClass::BlockComment);
                if line.contains(markers[idx].close.as_str()) {
                    state = State::Normal;
                }
            }
        }
    }
    out
}
