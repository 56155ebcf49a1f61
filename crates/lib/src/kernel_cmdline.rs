//! Kernel command line parsing and editing.
//!
//! This module provides functionality for parsing kernel command line
//! arguments, supporting both key-only switches and key-value pairs with
//! proper quote handling, and for editing a command line in place without
//! disturbing the parameters around the edit.

use std::borrow::Cow;
use std::ops::Range;

use anyhow::Result;

/// The kernel argument naming the program to run as pid 1.
pub(crate) const INIT: &str = "init";

/// A parsed kernel command line.
///
/// Wraps the raw command line bytes. Uses copy-on-write semantics to avoid
/// unnecessary allocations when working with borrowed data.
pub(crate) struct Cmdline<'a>(Cow<'a, [u8]>);

impl<'a, T: AsRef<[u8]> + ?Sized> From<&'a T> for Cmdline<'a> {
    fn from(input: &'a T) -> Self {
        Self(Cow::Borrowed(input.as_ref()))
    }
}

impl Cmdline<'_> {
    /// Reads the kernel command line from `/proc/cmdline`.
    pub fn from_proc() -> Result<Self> {
        Ok(Self(Cow::Owned(std::fs::read("/proc/cmdline")?)))
    }

    /// Byte ranges of each parameter, in order.
    ///
    /// Splits on unquoted ASCII whitespace; runs of whitespace never
    /// produce empty parameters.
    fn spans(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        let bytes = &*self.0;
        let mut pos = 0;
        std::iter::from_fn(move || {
            while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            if pos == bytes.len() {
                return None;
            }
            let start = pos;
            let mut in_quotes = false;
            while pos < bytes.len() {
                let c = bytes[pos];
                if c == b'"' {
                    in_quotes = !in_quotes;
                } else if !in_quotes && c.is_ascii_whitespace() {
                    break;
                }
                pos += 1;
            }
            Some(start..pos)
        })
    }

    /// Returns an iterator over all parameters in the command line.
    pub fn iter(&self) -> impl Iterator<Item = Parameter<'_>> + '_ {
        self.spans().map(|r| Parameter::from(&self.0[r]))
    }

    /// Locate a kernel argument with the given key name.
    ///
    /// Returns the first parameter matching the given key, or `None` if not found.
    /// Key comparison treats dashes and underscores as equivalent.
    pub fn find(&self, key: impl AsRef<[u8]>) -> Option<Parameter<'_>> {
        let key = ParameterKey(key.as_ref());
        self.iter().find(|p| p.key == key)
    }

    /// Locate the value of the kernel argument with the given key name.
    pub fn value_of(&self, key: impl AsRef<[u8]>) -> Option<&[u8]> {
        self.find(key).and_then(|p| p.value)
    }

    /// Locate the UTF-8 value of the kernel argument with the given key name.
    pub fn value_of_utf8(&self, key: &str) -> Result<Option<&str>, std::str::Utf8Error> {
        self.value_of(key).map(std::str::from_utf8).transpose()
    }

    /// The command line with every parameter equal to `param` removed.
    ///
    /// Leading and trailing whitespace (such as the final newline of a
    /// file) is kept, and each surviving parameter keeps the separator that
    /// preceded it. When nothing matches, the input is returned as-is.
    pub fn without(&self, param: &Parameter<'_>) -> Cow<'_, [u8]> {
        let bytes = &*self.0;
        let spans: Vec<_> = self.spans().collect();
        let matches = |r: &Range<usize>| Parameter::from(&bytes[r.clone()]) == *param;
        let (Some(first), Some(last)) = (spans.first(), spans.last()) else {
            return Cow::Borrowed(bytes);
        };
        if !spans.iter().any(|r| matches(r)) {
            return Cow::Borrowed(bytes);
        }

        let mut out = Vec::with_capacity(bytes.len());
        out.extend_from_slice(&bytes[..first.start]);
        let mut kept_any = false;
        for (i, r) in spans.iter().enumerate() {
            if matches(r) {
                continue;
            }
            if kept_any {
                out.extend_from_slice(&bytes[spans[i - 1].end..r.start]);
            }
            out.extend_from_slice(&bytes[r.clone()]);
            kept_any = true;
        }
        out.extend_from_slice(&bytes[last.end..]);
        Cow::Owned(out)
    }

    /// The command line with `param` appended after the last parameter,
    /// unless an equal parameter is already present.
    pub fn with(&self, param: &Parameter<'_>) -> Cow<'_, [u8]> {
        let bytes = &*self.0;
        if self.iter().any(|p| p == *param) {
            return Cow::Borrowed(bytes);
        }
        let body_end = self.spans().last().map_or(0, |r| r.end);
        let mut out = Vec::with_capacity(bytes.len() + param.parameter.len() + 1);
        out.extend_from_slice(&bytes[..body_end]);
        if body_end > 0 {
            out.push(b' ');
        }
        out.extend_from_slice(param.parameter);
        out.extend_from_slice(&bytes[body_end..]);
        Cow::Owned(out)
    }
}

/// A single kernel command line parameter key
///
/// Treats dashes and underscores in keys as equivalent.
#[derive(Debug, Eq)]
pub(crate) struct ParameterKey<'a>(&'a [u8]);

/// A single kernel command line parameter.
#[derive(Debug, Eq)]
pub(crate) struct Parameter<'a> {
    /// The full original value
    pub parameter: &'a [u8],
    /// The parameter key as raw bytes
    pub key: ParameterKey<'a>,
    /// The parameter value as raw bytes, if present
    pub value: Option<&'a [u8]>,
}

impl<'a, T: AsRef<[u8]> + ?Sized> From<&'a T> for Parameter<'a> {
    /// Parses a parameter from raw bytes.
    ///
    /// Splits on the first `=` character to separate key and value.
    /// Strips only the outermost pair of double quotes from values.
    /// If no `=` is found, treats the entire input as a key-only parameter.
    fn from(input: &'a T) -> Self {
        let input = input.as_ref();
        let equals = input.iter().position(|b| *b == b'=');

        match equals {
            None => Self {
                parameter: input,
                key: ParameterKey(input),
                value: None,
            },
            Some(i) => {
                let (key, mut value) = input.split_at(i);
                let key = ParameterKey(key);

                // skip `=`, we know it's the first byte because we
                // found it above
                value = &value[1..];

                // *Only* the first and last double quotes are stripped
                value = value
                    .strip_prefix(b"\"")
                    .unwrap_or(value)
                    .strip_suffix(b"\"")
                    .unwrap_or(value);

                Self {
                    parameter: input,
                    key,
                    value: Some(value),
                }
            }
        }
    }
}

impl PartialEq for ParameterKey<'_> {
    /// Keys are compared with dashes and underscores treated as equivalent.
    /// This comparison is case-sensitive.
    fn eq(&self, other: &Self) -> bool {
        let dedashed = |&c: &u8| {
            if c == b'-' {
                b'_'
            } else {
                c
            }
        };

        // We can't just zip() because leading substrings will match
        let our_iter = self.0.iter().map(dedashed);
        let other_iter = other.0.iter().map(dedashed);
        our_iter.eq(other_iter)
    }
}

impl PartialEq for Parameter<'_> {
    fn eq(&self, other: &Self) -> bool {
        // Note we don't compare parameter because we want hyphen-dash insensitivity for the key
        self.key == other.key && self.value == other.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn without(cmdline: &str, param: &str) -> String {
        let c = Cmdline::from(cmdline);
        String::from_utf8(c.without(&Parameter::from(param)).into_owned()).unwrap()
    }

    fn with(cmdline: &str, param: &str) -> String {
        let c = Cmdline::from(cmdline);
        String::from_utf8(c.with(&Parameter::from(param)).into_owned()).unwrap()
    }

    #[test]
    fn test_parameter_simple() {
        let switch = Parameter::from("foo");
        assert_eq!(switch.key.0, b"foo");
        assert_eq!(switch.value, None);

        let kv = Parameter::from("bar=baz");
        assert_eq!(kv.key.0, b"bar");
        assert_eq!(kv.value, Some(b"baz".as_slice()));
    }

    #[test]
    fn test_parameter_quoted() {
        let p = Parameter::from("foo=\"quoted value\"");
        assert_eq!(p.value, Some(b"quoted value".as_slice()));

        // quotes only get stripped from the absolute ends of values
        let p = Parameter::from("foo=\"internal \" quotes \" are ok\"");
        assert_eq!(p.value, Some(b"internal \" quotes \" are ok".as_slice()));
    }

    #[test]
    fn test_parameter_equality() {
        // substrings are not equal
        assert_ne!(Parameter::from("foo"), Parameter::from("foobar"));

        // dashes and underscores are treated equally
        assert_eq!(
            Parameter::from("a-delimited-param=same"),
            Parameter::from("a_delimited_param=same")
        );

        // same key, different values is not equal
        assert_ne!(
            Parameter::from("init=/first_boot/firstboot"),
            Parameter::from("init=/sbin/init")
        );

        // mixed variants are never equal
        assert_ne!(Parameter::from("init"), Parameter::from("init=/sbin/init"));

        // the outer quotes of a value don't matter
        assert_eq!(
            Parameter::from("init=\"/first_boot/firstboot\""),
            Parameter::from("init=/first_boot/firstboot")
        );
    }

    #[test]
    fn test_kargs_simple() {
        let kargs = Cmdline::from(b"foo=bar,bar2   baz=fuz wiz\n".as_slice());
        let mut iter = kargs.iter();

        assert_eq!(iter.next(), Some(Parameter::from(b"foo=bar,bar2")));
        assert_eq!(iter.next(), Some(Parameter::from(b"baz=fuz")));
        assert_eq!(iter.next(), Some(Parameter::from(b"wiz")));
        assert_eq!(iter.next(), None);

        assert_eq!(kargs.find("foo").unwrap().value.unwrap(), b"bar,bar2");
        assert!(kargs.find("nothing").is_none());
    }

    #[test]
    fn test_kargs_quoted_whitespace() {
        let kargs = Cmdline::from("a=\"b c\" d");
        let params: Vec<_> = kargs.iter().map(|p| p.parameter).collect();
        assert_eq!(params, [b"a=\"b c\"".as_slice(), b"d".as_slice()]);
    }

    #[test]
    fn test_kargs_find_dash_hyphen() {
        let kargs = Cmdline::from(b"a-b=1 a_b=2".as_slice());
        // find should find the first one, which is a-b=1
        let p = kargs.find("a_b").unwrap();
        assert_eq!(p.key.0, b"a-b");
        assert_eq!(p.value.unwrap(), b"1");
    }

    #[test]
    fn test_value_of_utf8() {
        let kargs = Cmdline::from("console=tty1 init=/first_boot/firstboot quiet");
        assert_eq!(
            kargs.value_of_utf8(INIT).unwrap(),
            Some("/first_boot/firstboot")
        );
        assert_eq!(kargs.value_of_utf8("quiet").unwrap(), None);
        assert_eq!(kargs.value_of_utf8("missing").unwrap(), None);

        let mut invalid_utf8 = b"init=".to_vec();
        invalid_utf8.push(0xff);
        let kargs = Cmdline::from(&invalid_utf8);
        assert!(kargs.value_of_utf8(INIT).is_err());
    }

    #[test]
    fn test_without_middle() {
        similar_asserts::assert_eq!(
            without(
                "console=serial0,115200 init=/first_boot/orchestrator rootwait",
                "init=/first_boot/orchestrator"
            ),
            "console=serial0,115200 rootwait"
        );
    }

    #[test]
    fn test_without_edges() {
        let t = "init=/first_boot/firstboot";
        assert_eq!(without("init=/first_boot/firstboot rootwait\n", t), "rootwait\n");
        assert_eq!(without("quiet init=/first_boot/firstboot\n", t), "quiet\n");
        assert_eq!(without("init=/first_boot/firstboot\n", t), "\n");
        assert_eq!(without("init=/first_boot/firstboot", t), "");
        assert_eq!(without("", t), "");
    }

    #[test]
    fn test_without_preserves_spacing() {
        let t = "init=/first_boot/firstboot";
        assert_eq!(
            without(" a  init=/first_boot/firstboot\tb   c \n", t),
            " a\tb   c \n"
        );
        // Every occurrence goes
        assert_eq!(
            without("a init=/first_boot/firstboot init=/first_boot/firstboot b", t),
            "a b"
        );
    }

    #[test]
    fn test_without_only_exact_match() {
        let t = "init=/first_boot/firstboot";
        let line = "init=/sbin/init initrd=foo init /first_boot/firstboot\n";
        let c = Cmdline::from(line);
        assert!(matches!(c.without(&Parameter::from(t)), Cow::Borrowed(_)));
        assert_eq!(without(line, t), line);
    }

    #[test]
    fn test_without_idempotent() {
        let t = "init=/first_boot/firstboot";
        let once = without("a init=/first_boot/firstboot b\n", t);
        assert_eq!(without(&once, t), once);
    }

    #[test]
    fn test_with() {
        let t = "init=/first_boot/firstboot";
        assert_eq!(
            with("console=tty1 rootwait\n", t),
            "console=tty1 rootwait init=/first_boot/firstboot\n"
        );
        assert_eq!(with("\n", t), "init=/first_boot/firstboot\n");
        assert_eq!(with("", t), "init=/first_boot/firstboot");
        let present = "a init=/first_boot/firstboot b\n";
        assert_eq!(with(present, t), present);
    }

    #[test]
    fn test_with_then_without() {
        let t = "init=/first_boot/firstboot";
        let orig = "console=serial0,115200 console=tty1 root=PARTUUID=abc-02 rootwait\n";
        assert_eq!(without(&with(orig, t), t), orig);
    }
}
