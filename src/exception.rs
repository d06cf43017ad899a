//! Exception rehydration (spec §9 "Exception rehydration", §7).
//!
//! The wire carries a failed call as `ExceptionName(repr-of-args)` text.
//! This reconstructs a typed [`RemoteException`] from a closed table of
//! well-known names, falling back to a generic carrier that preserves the
//! original text for anything unrecognized -- grounded on
//! `original_source/speedysvc/client_server/shared_memory/SHMClient.py`'s
//! `__handle_exception`, minus that method's `literal_eval` of the
//! argument tuple (which has no safe Rust analogue and isn't needed: the
//! full text is preserved either way).

use crate::error::RemoteException;

/// Render a handler-raised exception as wire text: `Name(args)`.
pub fn encode(name: &str, args: &str) -> String {
    format!("{name}({args})")
}

/// Parse wire text of the form `Name(args)` back into a typed exception.
/// Text without a recognized `Name(` prefix is carried whole in
/// [`RemoteException::Generic`].
pub fn decode(text: &str) -> RemoteException {
    let Some(open) = text.find('(') else {
        return RemoteException::Generic(text.to_string());
    };
    if !text.ends_with(')') {
        return RemoteException::Generic(text.to_string());
    }
    let name = &text[..open];
    let args = &text[open + 1..text.len() - 1];

    match name {
        "ValueError" => RemoteException::ValueError(args.to_string()),
        "TypeError" => RemoteException::TypeError(args.to_string()),
        "KeyError" => RemoteException::KeyError(args.to_string()),
        "RuntimeError" => RemoteException::RuntimeError(args.to_string()),
        "TimeoutError" => RemoteException::TimeoutError(args.to_string()),
        "UnknownMethod" => RemoteException::UnknownMethod(args.to_string()),
        _ => RemoteException::Generic(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_exception() {
        let text = encode("ValueError", "x");
        assert_eq!(text, "ValueError(x)");
        let decoded = decode(&text);
        assert_eq!(decoded, RemoteException::ValueError("x".to_string()));
        assert!(decoded.to_string().contains('x'));
    }

    #[test]
    fn unknown_name_falls_back_to_generic() {
        let decoded = decode("WeirdCustomError(1, 2)");
        assert_eq!(
            decoded,
            RemoteException::Generic("WeirdCustomError(1, 2)".to_string())
        );
    }

    #[test]
    fn text_without_parens_is_generic() {
        let decoded = decode("plain failure message");
        assert_eq!(
            decoded,
            RemoteException::Generic("plain failure message".to_string())
        );
    }
}
