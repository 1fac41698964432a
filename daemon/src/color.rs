/// Logical indicator colors and the state-to-color policy.
///
/// `color_for` is the only place that decides what the light means; change
/// the table here and nowhere else.
use std::fmt;

use crate::state::DashcamState;

/// A color the tri-color indicator can show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Color {
    Off,
    Red,
    Green,
    Blue,
    Yellow,
    White,
}

#[cfg(test)]
impl Color {
    pub const ALL: [Color; 6] = [
        Color::Off,
        Color::Red,
        Color::Green,
        Color::Blue,
        Color::Yellow,
        Color::White,
    ];
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Color::Off => "off",
            Color::Red => "red",
            Color::Green => "green",
            Color::Blue => "blue",
            Color::Yellow => "yellow",
            Color::White => "white",
        };
        f.write_str(name)
    }
}

/// Maps a pipeline state to the color shown for it.
///
/// RED is shared by `Dead` and `Error`: the light only has six colors.
/// Recording is the normal case and leaves the light dark.
pub fn color_for(state: DashcamState) -> Color {
    match state {
        DashcamState::Dead => Color::Red,
        DashcamState::Error => Color::Red,
        DashcamState::Starting => Color::Blue,
        DashcamState::Recording => Color::Off,
        DashcamState::FallingBehind => Color::Yellow,
        DashcamState::Converting => Color::Green,
        DashcamState::Uploading => Color::Blue,
    }
}
