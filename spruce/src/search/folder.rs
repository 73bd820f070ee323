//! # Folder search
//!
//! The folder-side bindings of the search engine: `match-all`
//! iteration over summary records, envelope and header predicates,
//! flag and date accessors. A [`FolderSearch`] instance also caches
//! the last compiled expression so repeated queries skip the parser.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::{
    envelope,
    error::Result,
    flag::Flags,
    summary::MessageInfo,
};

use super::{
    parser::{parse, Term},
    SearchContext, SearchExt, Value,
};

/// What the search engine needs from a folder: its summary records
/// and on-demand access to full messages.
pub trait SearchSource {
    fn records(&self) -> &[MessageInfo];

    fn read_message(&self, uid: &str) -> Result<Vec<u8>>;
}

/// Override hook for `body-contains`, e.g. a content-indexing layer.
pub type BodyContainsFn = Box<dyn Fn(&MessageInfo, &str) -> bool + Send>;

/// A per-folder search instance.
pub struct FolderSearch {
    last: Option<(String, Term)>,
    body_contains: Option<BodyContainsFn>,
}

impl Default for FolderSearch {
    fn default() -> Self {
        Self::new()
    }
}

impl FolderSearch {
    pub fn new() -> Self {
        Self {
            last: None,
            body_contains: None,
        }
    }

    /// Replace the stubbed `body-contains` with a real predicate.
    pub fn set_body_contains(&mut self, predicate: BodyContainsFn) {
        self.body_contains = Some(predicate);
    }

    /// Run an expression over the source's records, returning the
    /// matching uids.
    pub fn search(&mut self, source: &dyn SearchSource, expression: &str) -> Result<Vec<String>> {
        let term = match &self.last {
            Some((cached, term)) if cached == expression => term.clone(),
            _ => {
                let term = parse(expression)?;
                self.last = Some((expression.to_owned(), term.clone()));
                term
            }
        };

        let mut ctx = SearchContext::new();
        let mut ext = FolderExt {
            source,
            body_contains: self.body_contains.as_deref(),
            current: None,
            message: None,
        };

        match ctx.run(&term, &mut ext)? {
            Value::Array(uids) => Ok(uids),
            _ => Ok(Vec::new()),
        }
    }
}

struct FolderExt<'a> {
    source: &'a dyn SearchSource,
    body_contains: Option<&'a (dyn Fn(&MessageInfo, &str) -> bool + Send)>,
    /// Index of the record `match-all` is currently visiting.
    current: Option<usize>,
    /// The lazily fetched full message for the current record.
    message: Option<Vec<u8>>,
}

impl FolderExt<'_> {
    fn current<'s>(&'s self, ctx: &mut SearchContext) -> Result<&'s MessageInfo> {
        match self.current.and_then(|i| self.source.records().get(i)) {
            Some(info) => Ok(info),
            None => ctx.throw("no current message outside (match-all )"),
        }
    }

    fn two_strings(
        ctx: &mut SearchContext,
        values: &[Value],
        name: &str,
    ) -> Result<(String, String)> {
        match values {
            [Value::Str(a), Value::Str(b)] => Ok((a.clone(), b.clone())),
            [_, _] => ctx.throw(format!("incompatible argument types in ({name} )")),
            _ => ctx.throw(format!("incorrect argument count in ({name} )")),
        }
    }

    fn match_all(&mut self, ctx: &mut SearchContext, args: &[Term]) -> Result<Value> {
        if args.len() != 1 {
            return ctx.throw("incorrect argument count in (match-all )");
        }

        let mut uids = Vec::new();
        for i in 0..self.source.records().len() {
            self.current = Some(i);

            let result = ctx.eval(&args[0], self);
            self.message = None;
            let value = match result {
                Ok(value) => value,
                Err(err) => {
                    self.current = None;
                    return Err(err);
                }
            };

            let info = &self.source.records()[i];
            let matched = match value {
                Value::Bool(matched) => matched,
                // a bare flag bit matches messages carrying that flag
                Value::Int(bits) => info.flags.bits() as i64 & bits != 0,
                _ => false,
            };
            if matched {
                uids.push(info.uid.clone());
            }
        }
        self.current = None;

        Ok(Value::Array(uids))
    }

    fn header_contains(&mut self, ctx: &mut SearchContext, args: &[Term]) -> Result<Value> {
        let values = ctx.eval_args(args, self)?;
        let (header, needle) = Self::two_strings(ctx, &values, "header-contains")?;
        let needle = needle.to_lowercase();

        let contains = |haystack: &str| haystack.to_lowercase().contains(&needle);

        let info = self.current(ctx)?;
        let matched = if header.eq_ignore_ascii_case("From") {
            contains(&info.from)
        } else if header.eq_ignore_ascii_case("To") {
            contains(&info.to)
        } else if header.eq_ignore_ascii_case("Cc") {
            contains(&info.cc)
        } else if header.eq_ignore_ascii_case("Subject") {
            contains(&info.subject)
        } else {
            // not cached in the summary: fetch the full message once
            // per record
            let uid = info.uid.clone();
            if self.message.is_none() {
                self.message = Some(self.source.read_message(&uid)?);
            }
            self.message
                .as_deref()
                .and_then(|raw| envelope::header_value(raw, &header))
                .map(|value| contains(&value))
                .unwrap_or(false)
        };

        Ok(Value::Bool(matched))
    }

    fn body_contains(&mut self, ctx: &mut SearchContext, args: &[Term]) -> Result<Value> {
        let values = ctx.eval_args(args, self)?;
        let needle = match values.as_slice() {
            [Value::Str(needle)] => needle.clone(),
            _ => return ctx.throw("incorrect argument count in (body-contains )"),
        };

        let matched = match self.body_contains {
            Some(predicate) => {
                let info = self.current(ctx)?;
                predicate(info, &needle)
            }
            // without a content index this is a stub
            None => false,
        };

        Ok(Value::Bool(matched))
    }

    fn system_flag(&mut self, ctx: &mut SearchContext, args: &[Term]) -> Result<Value> {
        let values = ctx.eval_args(args, self)?;
        match values.as_slice() {
            [Value::Str(name)] => match Flags::system_flag(name) {
                Ok(flag) => Ok(Value::Int(flag.bits() as i64)),
                Err(err) => ctx.throw(err.to_string()),
            },
            [_] => ctx.throw("incorrect argument type in (system-flag )"),
            _ => ctx.throw("incorrect argument count in (system-flag )"),
        }
    }

    fn no_args(
        &mut self,
        ctx: &mut SearchContext,
        args: &[Term],
        name: &str,
    ) -> Result<()> {
        if args.is_empty() {
            Ok(())
        } else {
            ctx.throw(format!("incorrect argument count in ({name} )"))
        }
    }
}

impl SearchExt for FolderExt<'_> {
    fn call(
        &mut self,
        ctx: &mut SearchContext,
        name: &str,
        args: &[Term],
    ) -> Result<Option<Value>> {
        let value = match name {
            "match-all" => self.match_all(ctx, args)?,
            "header-contains" => self.header_contains(ctx, args)?,
            "body-contains" => self.body_contains(ctx, args)?,
            "system-flag" => self.system_flag(ctx, args)?,
            "sent-date" => {
                self.no_args(ctx, args, "sent-date")?;
                Value::Time(self.current(ctx)?.date_sent)
            }
            "received-date" => {
                self.no_args(ctx, args, "received-date")?;
                Value::Time(self.current(ctx)?.date_received)
            }
            "current-date" => {
                self.no_args(ctx, args, "current-date")?;
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or_default();
                Value::Time(now)
            }
            "size" => {
                self.no_args(ctx, args, "size")?;
                Value::Int(self.current(ctx)?.size as i64)
            }
            _ => return Ok(None),
        };

        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use crate::{flag::Flags, summary::MessageInfo};

    use super::{FolderSearch, SearchSource};

    struct FakeSource {
        records: Vec<MessageInfo>,
    }

    impl SearchSource for FakeSource {
        fn records(&self) -> &[MessageInfo] {
            &self.records
        }

        fn read_message(&self, uid: &str) -> crate::error::Result<Vec<u8>> {
            Ok(format!("X-Custom: value-{uid}\nSubject: m{uid}\n\nbody\n").into_bytes())
        }
    }

    fn record(uid: &str, flags: Flags, subject: &str, size: u32) -> MessageInfo {
        MessageInfo {
            uid: uid.into(),
            flags,
            subject: subject.into(),
            from: format!("sender-{uid}@example.com"),
            size,
            ..Default::default()
        }
    }

    fn source() -> FakeSource {
        FakeSource {
            records: vec![
                record("1", Flags::SEEN, "hello world", 100),
                record("2", Flags::SEEN | Flags::ANSWERED, "re: hello", 5000),
                record("3", Flags::ANSWERED, "totally different", 50),
            ],
        }
    }

    #[test]
    fn match_all_by_flag() {
        let mut search = FolderSearch::new();
        let uids = search
            .search(&source(), "(match-all (system-flag \"seen\"))")
            .unwrap();
        assert_eq!(uids, ["1", "2"]);
    }

    #[test]
    fn flag_intersection() {
        let mut search = FolderSearch::new();
        let uids = search
            .search(
                &source(),
                "(and (match-all (system-flag \"seen\")) (match-all (system-flag \"answered\")))",
            )
            .unwrap();
        assert_eq!(uids, ["2"]);
    }

    #[test]
    fn header_contains_envelope_and_fetched() {
        let mut search = FolderSearch::new();

        let uids = search
            .search(&source(), "(match-all (header-contains \"Subject\" \"HELLO\"))")
            .unwrap();
        assert_eq!(uids, ["1", "2"]);

        // a header that is not cached forces a message fetch
        let uids = search
            .search(&source(), "(match-all (header-contains \"X-Custom\" \"value-3\"))")
            .unwrap();
        assert_eq!(uids, ["3"]);
    }

    #[test]
    fn size_predicate() {
        let mut search = FolderSearch::new();
        let uids = search
            .search(&source(), "(match-all (> (size) 99))")
            .unwrap();
        assert_eq!(uids, ["1", "2"]);
    }

    #[test]
    fn body_contains_stub_and_override() {
        let mut search = FolderSearch::new();
        let uids = search
            .search(&source(), "(match-all (body-contains \"body\"))")
            .unwrap();
        assert!(uids.is_empty());

        search.set_body_contains(Box::new(|info, needle| {
            info.uid == "2" && needle == "body"
        }));
        let uids = search
            .search(&source(), "(match-all (body-contains \"body\"))")
            .unwrap();
        assert_eq!(uids, ["2"]);
    }

    #[test]
    fn expression_cache_is_reused() {
        let mut search = FolderSearch::new();
        let expr = "(match-all (system-flag \"seen\"))";
        let first = search.search(&source(), expr).unwrap();
        let second = search.search(&source(), expr).unwrap();
        assert_eq!(first, second);
    }
}
