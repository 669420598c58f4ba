/// Declare a newtype wrapper around a primitive integer.
///
/// The generated type is `Copy`, ordered, hashable, serde-transparent, derefs
/// to the inner value, converts both ways with `From`, and prints as
/// `Name(value)` in debug output and as the bare value (or hex with `{:x}`)
/// otherwise.
#[macro_export]
macro_rules! strong_type {
    ($name:ident, $inner:ty) => {
        #[derive(
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Default,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            #[inline]
            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl ::std::ops::Deref for $name {
            type Target = $inner;

            #[inline]
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl ::std::fmt::LowerHex for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                ::std::fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl From<$inner> for $name {
            #[inline]
            fn from(val: $inner) -> Self {
                Self(val)
            }
        }

        impl From<$name> for $inner {
            #[inline]
            fn from(val: $name) -> Self {
                val.0
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    strong_type!(Handle, u32);

    #[test]
    fn test_strong_type_get_and_deref() {
        let h = Handle(42);
        assert_eq!(h.get(), 42);
        assert_eq!(*h, 42);
    }

    #[test]
    fn test_strong_type_formatting() {
        let h = Handle(255);
        assert_eq!(format!("{}", h), "255");
        assert_eq!(format!("{:?}", h), "Handle(255)");
        assert_eq!(format!("{:#x}", h), "0xff");
    }

    #[test]
    fn test_strong_type_hash_and_default() {
        let mut set = HashSet::new();
        set.insert(Handle(1));
        set.insert(Handle(1));
        set.insert(Handle::default());
        assert_eq!(set.len(), 2);
    }
}
