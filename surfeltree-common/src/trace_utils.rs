pub use tracy_client;

/// Concatenate the current module path and the given string literal.
/// Utility macro for [crate::span].
#[macro_export]
macro_rules! fqn {
    ($l: literal) => {
        ::std::concat!(::std::module_path!(), " ", $l)
    };
}

/// Opens a profiling span ([tracy_client::Span]) for the enclosing pipeline step.
/// Without the `trace` feature this compiles down to nothing.
#[macro_export]
macro_rules! span {
    ($fn: literal) => {
        $crate::trace_utils::tracy_client::Span::new(
            "",
            $crate::fqn!($fn),
            ::std::file!(),
            ::std::line!(),
            16,
        )
    };
}
