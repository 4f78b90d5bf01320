//! Map persistence.

mod format;

pub use format::{
    load_map, read_map, save_map, write_map, SerialiseProgress, MAGIC, VERSION,
};
