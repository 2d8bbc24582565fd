pub mod format_converter;
