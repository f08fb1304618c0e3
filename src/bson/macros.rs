//! Construction macros for BSON values and documents.

/// Construct a [`Bson`](crate::bson::Bson) value from a literal, an expression convertible into
/// one, or a `{ .. }` document literal.
#[macro_export]
macro_rules! bson {
    (null) => {
        $crate::bson::Bson::Null
    };
    ({ $($tt:tt)* }) => {
        $crate::bson::Bson::Document($crate::doc! { $($tt)* })
    };
    ($other:expr) => {
        $crate::bson::Bson::from($other)
    };
}

/// Construct a [`Document`](crate::bson::Document) from `"key": value` pairs. Values may be
/// `null`, nested `{ .. }` document literals, or any expression convertible into a
/// [`Bson`](crate::bson::Bson).
#[macro_export]
macro_rules! doc {
    () => {
        $crate::bson::Document::new()
    };
    ( $($tt:tt)+ ) => {{
        #[allow(unused_mut)]
        let mut object = $crate::bson::Document::new();
        $crate::doc_internal!(@object object ($($tt)+));
        object
    }};
}

#[macro_export]
#[doc(hidden)]
macro_rules! doc_internal {
    (@object $object:ident ()) => {};
    (@object $object:ident ($key:tt : null $(, $($rest:tt)*)?)) => {
        $object.insert($key, $crate::bson::Bson::Null);
        $crate::doc_internal!(@object $object ($($($rest)*)?));
    };
    (@object $object:ident ($key:tt : { $($map:tt)* } $(, $($rest:tt)*)?)) => {
        $object.insert($key, $crate::doc! { $($map)* });
        $crate::doc_internal!(@object $object ($($($rest)*)?));
    };
    (@object $object:ident ($key:tt : $value:expr $(, $($rest:tt)*)?)) => {
        $object.insert($key, $value);
        $crate::doc_internal!(@object $object ($($($rest)*)?));
    };
}

#[cfg(test)]
mod test {
    use crate::{bson::Bson, doc};

    #[test]
    fn literals_and_nesting() {
        let d = doc! {
            "a": 1,
            "b": "two",
            "c": null,
            "d": { "nested": true },
            "e": vec![Bson::Int32(1), Bson::Int32(2)],
        };
        assert_eq!(d.get("a"), Some(&Bson::Int32(1)));
        assert_eq!(d.get_str("b"), Some("two"));
        assert_eq!(d.get("c"), Some(&Bson::Null));
        assert_eq!(d.get_document("d").unwrap().get_bool("nested"), Some(true));
        assert_eq!(d.get_array("e").unwrap().len(), 2);
    }

    #[test]
    fn empty_document() {
        assert!(doc! {}.is_empty());
    }

    #[test]
    fn constant_keys_are_accepted() {
        const COMMAND_NAME: &str = "isMaster";
        let d = doc! { COMMAND_NAME: 1 };
        assert_eq!(d.get_i32("isMaster"), Some(1));
    }
}
