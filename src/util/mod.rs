//! Small internal utilities.

mod det_rng;

pub(crate) use det_rng::DetRng;
