pub(crate) mod glob;
pub(crate) mod scoped_timer;
pub(crate) mod slot;
