//! Serialization of populated tombs
//!
//! Each populated tomb becomes one JSON line:
//!
//! ```text
//! {"location": {"file": "a.php", "start": 10, "end": 20}, "scope": "Foo", "function": "bar"}
//! ```
//!
//! `file` and `scope` are left out when absent. Enumeration is not
//! synchronized with populate or vacate, so a dump is a best-effort snapshot.

use crate::graveyard::Graveyard;
use crate::strings::StringStore;
use crate::tomb::TombFields;
use serde::Serialize;
use serde_json::ser::Formatter;
use std::io::{self, Write};

/// Source range of a tomb
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RecordLocation<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<&'a str>,
    pub start: u32,
    pub end: u32,
}

/// A populated tomb, borrowed from the graveyard's string store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TombRecord<'a> {
    #[serde(skip)]
    pub slot: usize,
    pub location: RecordLocation<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<&'a str>,
    pub function: &'a str,
}

impl<'a> TombRecord<'a> {
    fn resolve(slot: usize, fields: TombFields, strings: &'a StringStore) -> Self {
        Self {
            slot,
            location: RecordLocation {
                file: fields.file.map(|f| strings.get(f)),
                start: fields.line_start,
                end: fields.line_end,
            },
            scope: fields.scope.map(|s| strings.get(s)),
            function: strings.get(fields.function),
        }
    }

    /// Write this record as a single JSON object, without a line break
    pub fn write_json<W: Write>(&self, writer: W) -> io::Result<()> {
        let mut ser = serde_json::Serializer::with_formatter(writer, SpacedFormatter);
        self.serialize(&mut ser).map_err(io::Error::from)
    }
}

/// Compact JSON with a space after every `:` and `,`
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    #[inline]
    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    #[inline]
    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        writer.write_all(b": ")
    }
}

/// Lazy walk over the populated tombs of a graveyard, in slot order
pub struct Records<'g> {
    graveyard: &'g Graveyard,
    next: usize,
}

impl<'g> Iterator for Records<'g> {
    type Item = TombRecord<'g>;

    fn next(&mut self) -> Option<Self::Item> {
        let tombs = self.graveyard.tombs();
        while let Some(tomb) = tombs.get(self.next) {
            let slot = self.next;
            self.next += 1;

            if let Some(fields) = tomb.fields() {
                return Some(TombRecord::resolve(slot, fields, self.graveyard.strings()));
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.graveyard.slots().saturating_sub(self.next)))
    }
}

impl Graveyard {
    /// Iterate over the tombs populated right now
    ///
    /// Each call starts again from slot 0 and reflects the current state.
    pub fn records(&self) -> Records<'_> {
        Records {
            graveyard: self,
            next: 0,
        }
    }

    /// Write one JSON line per populated tomb to `sink`
    ///
    /// Returns the number of records written. Stops at the first write error;
    /// what to do about it is up to the owner of the sink.
    pub fn dump<W: Write>(&self, mut sink: W) -> io::Result<usize> {
        let mut written = 0;
        for record in self.records() {
            record.write_json(&mut sink)?;
            sink.write_all(b"\n")?;
            written += 1;
        }
        sink.flush()?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graveyard::Declaration;
    use std::sync::Arc;

    fn graveyard(slots: usize) -> Graveyard {
        let strings = StringStore::new(64 * 1024, 1024).unwrap();
        Graveyard::startup(slots, Arc::new(strings)).unwrap()
    }

    fn dump_string(g: &Graveyard) -> String {
        let mut out = Vec::new();
        g.dump(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_populate_dump_vacate() {
        let g = graveyard(4);
        g.populate(
            0,
            &Declaration {
                file: Some("a.php"),
                scope: None,
                function: "foo",
                line_start: 10,
                line_end: 20,
            },
        );
        assert_eq!(g.used(), 1);
        assert_eq!(
            dump_string(&g),
            "{\"location\": {\"file\": \"a.php\", \"start\": 10, \"end\": 20}, \"function\": \"foo\"}\n"
        );

        g.vacate(0);
        assert_eq!(g.used(), 0);
        assert_eq!(dump_string(&g), "");
    }

    #[test]
    fn test_optional_fields() {
        let g = graveyard(4);
        g.populate(
            3,
            &Declaration {
                file: None,
                scope: Some("Foo\\Bar"),
                function: "baz",
                line_start: 1,
                line_end: 2,
            },
        );
        g.populate(
            1,
            &Declaration {
                function: "qux",
                line_start: 5,
                line_end: 6,
                ..Default::default()
            },
        );

        assert_eq!(
            dump_string(&g),
            concat!(
                "{\"location\": {\"start\": 5, \"end\": 6}, \"function\": \"qux\"}\n",
                "{\"location\": {\"start\": 1, \"end\": 2}, \"scope\": \"Foo\\\\Bar\", \"function\": \"baz\"}\n",
            )
        );
    }

    #[test]
    fn test_records_parse_as_json() {
        let g = graveyard(8);
        g.populate(
            5,
            &Declaration {
                file: Some("/srv/\"quoted\".php"),
                scope: Some("Widget"),
                function: "render",
                line_start: 40,
                line_end: 99,
            },
        );

        let out = dump_string(&g);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 1);

        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["location"]["file"], "/srv/\"quoted\".php");
        assert_eq!(value["location"]["start"], 40);
        assert_eq!(value["location"]["end"], 99);
        assert_eq!(value["scope"], "Widget");
        assert_eq!(value["function"], "render");
    }

    #[test]
    fn test_records_restartable() {
        let g = graveyard(4);
        g.populate(0, &Declaration { function: "a", ..Default::default() });
        g.populate(2, &Declaration { function: "b", ..Default::default() });

        let first: Vec<_> = g.records().map(|r| (r.slot, r.function)).collect();
        assert_eq!(first, [(0, "a"), (2, "b")]);

        g.vacate(0);
        let second: Vec<_> = g.records().map(|r| r.slot).collect();
        assert_eq!(second, [2]);
    }

    #[test]
    fn test_dump_returns_count() {
        let g = graveyard(16);
        for slot in (0..16).step_by(3) {
            g.populate(slot, &Declaration { function: "f", ..Default::default() });
        }
        let mut out = Vec::new();
        assert_eq!(g.dump(&mut out).unwrap(), 6);
    }
}
