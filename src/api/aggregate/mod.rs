mod counts;

pub use counts::*;
