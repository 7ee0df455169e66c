pub(crate) mod config;
pub(crate) mod generate;
pub(crate) mod parse;
pub(crate) mod permits;
pub(crate) mod runs;
pub(crate) mod work_orders;
