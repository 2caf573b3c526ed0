//! Various utilities functions and types

mod clock;
mod geometry;
mod serial;

pub use self::clock::{Clock, ClockSource, Monotonic, NonNegativeClockSource, Time};
pub use self::geometry::{Buffer, Physical, Point, Rectangle, Size, Transform};
pub use self::serial::{Serial, SerialCounter};
