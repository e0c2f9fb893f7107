//! ER-012: Control-flow executor: walks a recipe body against a line
//! stream (decoding) or a data record (encoding).
//!
//! Scope and stream cursor live in [`Overlay`]s so that a lookahead window
//! can run a branch speculatively and throw away everything it did. Record
//! nodes are handed to the [`RecordMapper`]; the executor itself only deals
//! with sections, loops, branches, abbreviations and comments.

use super::error::{EngineError, Mismatch, Result, TrailEntry};
use super::expr::{evaluate_condition, evaluate_index, Direction};
use super::lookahead::{Lookahead, Step};
use super::mapper::{Io, RecordMapper};
use super::overlay::Overlay;
use super::scope::Scope;
use super::types::{Branch, ForLoop, IfClause, Node, Options, RepeatLoop, SectionNode};
use super::value::Record;
use crate::format::records::is_blank;
use crate::format::FieldCodec;
use indexmap::IndexMap;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::OnceLock;
use tracing::{debug, trace};

/// Stream position and the most recent record templates attempted.
#[derive(Debug, Clone, Default)]
pub struct Cursor {
    pub ofs: usize,
    pub trail: VecDeque<TrailEntry>,
}

/// Result of decoding one section.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub data: Record,
    /// Lines consumed from the section input.
    pub consumed: usize,
    pub warnings: Vec<Mismatch>,
    /// Variable descriptions keyed by `section/path/NAME`.
    pub descriptions: IndexMap<String, String>,
}

pub struct Executor<'r> {
    direction: Direction,
    opts: &'r Options,
    codec: &'r dyn FieldCodec,
    lines: &'r [String],
    scope: Overlay<Scope>,
    cursor: Overlay<Cursor>,
    lookahead: Lookahead,
    output: Vec<String>,
    warnings: Vec<Mismatch>,
    descriptions: IndexMap<String, String>,
}

/// Decode `lines` with `body`. `root` holds values known up front
/// (MAT/MF/MT).
pub fn decode(
    body: &[Node],
    lines: &[String],
    root: Record,
    opts: &Options,
    codec: &dyn FieldCodec,
) -> Result<Decoded> {
    let mut exec = Executor::new(Direction::Read, lines, root, opts, codec);
    exec.run(body)?;
    exec.into_decoded()
}

/// Encode `data` with `body` into lines without line numbers.
pub fn encode(body: &[Node], data: &Record, opts: &Options, codec: &dyn FieldCodec) -> Result<Vec<String>> {
    let mut exec = Executor::new(Direction::Write, &[], data.clone(), opts, codec);
    exec.run(body)?;
    exec.scope.get().verify_retrieval()?;
    Ok(exec.output)
}

impl<'r> Executor<'r> {
    pub fn new(
        direction: Direction,
        lines: &'r [String],
        root: Record,
        opts: &'r Options,
        codec: &'r dyn FieldCodec,
    ) -> Executor<'r> {
        let scope = match direction {
            Direction::Read => Scope::with_root(root, opts.array_mode),
            Direction::Write => Scope::supplied(root, opts.array_mode, opts.check_arrays),
        };
        Executor {
            direction,
            opts,
            codec,
            lines,
            scope: Overlay::new(scope),
            cursor: Overlay::new(Cursor::default()),
            lookahead: Lookahead::new(),
            output: Vec::new(),
            warnings: Vec::new(),
            descriptions: IndexMap::new(),
        }
    }

    /// Execute `body`; errors leave with the stream offset and trail.
    pub fn run(&mut self, body: &[Node]) -> Result<()> {
        self.block(body).map_err(|e| {
            let cursor = self.cursor.get();
            let offset = cursor.trail.back().and_then(|t| t.offset);
            e.locate(offset, cursor.trail.iter().cloned().collect())
        })
    }

    pub fn into_decoded(self) -> Result<Decoded> {
        let consumed = self.cursor.get().ofs;
        Ok(Decoded {
            data: self.scope.into_inner().into_root()?,
            consumed,
            warnings: self.warnings,
            descriptions: self.descriptions,
        })
    }

    fn reading(&self) -> bool {
        self.direction == Direction::Read
    }

    fn block(&mut self, body: &[Node]) -> Result<()> {
        for node in body {
            let step = if node.is_record() { Step::Leaf } else { Step::Control };
            if !self.lookahead.proceed(step) {
                break;
            }
            self.node(node)?;
        }
        Ok(())
    }

    fn node(&mut self, node: &Node) -> Result<()> {
        match node {
            Node::Section(s) => self.section(s),
            Node::ForLoop(l) => self.for_loop(l),
            Node::RepeatLoop(l) => self.repeat_loop(l),
            Node::IfClause(c) => self.if_clause(c),
            Node::Abbreviation(a) => self
                .scope
                .get_mut()
                .register_abbreviation(&a.name, a.expr.clone()),
            Node::Comment(text) => {
                if !self.lookahead.is_active() {
                    self.mine(text);
                }
                Ok(())
            }
            record => self.record(record),
        }
    }

    // ========================================================================
    // Records
    // ========================================================================

    fn record(&mut self, node: &Node) -> Result<()> {
        self.remember(node);
        debug!(template = %node, "record");
        let io = match self.direction {
            Direction::Read => Io::Read {
                lines: self.lines,
                ofs: &mut self.cursor.get_mut().ofs,
            },
            Direction::Write => Io::Write {
                out: &mut self.output,
            },
        };
        RecordMapper {
            scope: self.scope.get_mut(),
            lookahead: &mut self.lookahead,
            io,
            opts: self.opts,
            codec: self.codec,
            warnings: &mut self.warnings,
        }
        .map(node)
    }

    /// Push a trail entry for `node`, dropping the oldest beyond capacity.
    fn remember(&mut self, node: &Node) {
        let capacity = self.opts.trail_capacity;
        if capacity == 0 {
            return;
        }
        let (offset, line) = if self.reading() {
            let mut at = self.cursor.get().ofs;
            while self.lines.get(at).is_some_and(|l| is_blank(l)) {
                at += 1;
            }
            (Some(at), self.lines.get(at).cloned())
        } else {
            (None, None)
        };
        let trail = &mut self.cursor.get_mut().trail;
        while trail.len() >= capacity {
            trail.pop_front();
        }
        trail.push_back(TrailEntry {
            offset,
            line,
            template: node.to_string(),
        });
    }

    // ========================================================================
    // Sections and loops
    // ========================================================================

    fn section(&mut self, s: &SectionNode) -> Result<()> {
        let scope = self.scope.get_mut();
        let idx = s
            .name
            .indices
            .iter()
            .map(|e| evaluate_index(e, scope))
            .collect::<Result<Vec<_>>>()?;
        scope.open_section(&s.name.name, &idx, self.direction == Direction::Read)?;
        let res = self.block(&s.body);
        let closed = self.scope.get_mut().close_section();
        res?;
        closed
    }

    fn for_loop(&mut self, l: &ForLoop) -> Result<()> {
        let scope = self.scope.get_mut();
        let from = evaluate_index(&l.from, scope)?;
        let to = evaluate_index(&l.to, scope)?;
        if from > to {
            return Ok(());
        }
        scope.declare_loop_var(&l.var, from)?;
        let mut res = Ok(());
        for i in from..=to {
            if self.lookahead.is_exhausted() {
                break;
            }
            res = self
                .scope
                .get_mut()
                .set_loop_var(&l.var, i)
                .and_then(|_| self.block(&l.body));
            if res.is_err() {
                break;
            }
        }
        self.scope.get_mut().remove_loop_var(&l.var);
        res
    }

    fn progress_mark(&self) -> usize {
        if self.reading() {
            self.cursor.get().ofs
        } else {
            self.output.len()
        }
    }

    fn repeat_loop(&mut self, l: &RepeatLoop) -> Result<()> {
        let mut counter = evaluate_index(&l.from, self.scope.get_mut())?;
        if let Some(var) = &l.var {
            self.scope.get_mut().declare_loop_var(var, counter)?;
        }
        let res = self.repeat_iterations(l, &mut counter);
        if let Some(var) = &l.var {
            self.scope.get_mut().remove_loop_var(var);
        }
        res
    }

    fn repeat_iterations(&mut self, l: &RepeatLoop, counter: &mut i64) -> Result<()> {
        loop {
            let mark = self.progress_mark();
            self.block(&l.body)?;
            if self.lookahead.is_exhausted() {
                return Ok(());
            }
            if evaluate_condition(&l.until, self.scope.get_mut())? {
                return Ok(());
            }
            if self.progress_mark() == mark {
                return Err(EngineError::StalledRepeat(*counter));
            }
            *counter += 1;
            if let Some(var) = &l.var {
                self.scope.get_mut().set_loop_var(var, *counter)?;
            }
        }
    }

    // ========================================================================
    // Branches
    // ========================================================================

    fn if_clause(&mut self, c: &IfClause) -> Result<()> {
        for branch in &c.branches {
            if self.holds(branch)? {
                debug!(condition = %branch.when, "branch taken");
                return self.block(&branch.body);
            }
        }
        match &c.otherwise {
            Some(body) => {
                debug!("else branch taken");
                self.block(body)
            }
            None => Ok(()),
        }
    }

    /// Decide a branch, running its body speculatively first when it
    /// carries a lookahead directive and the executor is decoding.
    fn holds(&mut self, branch: &Branch) -> Result<bool> {
        let steps = match &branch.lookahead {
            Some(expr) if self.reading() => evaluate_index(expr, self.scope.get_mut())?,
            _ => return evaluate_condition(&branch.when, self.scope.get_mut()),
        };
        self.lookahead
            .enter(steps, &mut (&mut self.scope, &mut self.cursor))?;
        let verdict = match self.block(&branch.body) {
            Ok(()) => evaluate_condition(&branch.when, self.scope.get_mut()),
            Err(e) if e.rejects_branch() => {
                debug!(error = %e, "lookahead rejected branch");
                Ok(false)
            }
            Err(e) => Err(e),
        };
        self.lookahead.leave(&mut (&mut self.scope, &mut self.cursor));
        trace!(condition = %branch.when, ?verdict, "lookahead verdict");
        verdict
    }

    // ========================================================================
    // Comments
    // ========================================================================

    fn mine(&mut self, text: &str) {
        let path = self.scope.get().path();
        for (name, desc) in mine_comment(text) {
            let key = path
                .iter()
                .cloned()
                .chain(std::iter::once(name))
                .collect::<Vec<_>>()
                .join("/");
            self.descriptions.insert(key, desc);
        }
    }
}

fn var_line() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*#?\s*var\s+(?P<name>[A-Za-z0-9/*]+)\s*(\[[^\]]*\])?\s*:(?P<text>.*)$").ok()
    })
    .as_ref()
}

/// Variable descriptions in a comment: a line `# var NAME: text` starts
/// one, following lines without `var` continue it. A `var` line with no
/// text starts the description on the next line.
pub fn mine_comment(text: &str) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    let Some(re) = var_line() else {
        return out;
    };
    for line in text.lines() {
        if let Some(caps) = re.captures(line) {
            let desc = caps["text"].trim().to_string();
            out.push((caps["name"].to_string(), desc));
            continue;
        }
        let Some((_, desc)) = out.last_mut() else {
            continue;
        };
        let cont = line.trim_start().trim_start_matches('#').trim();
        if cont.is_empty() {
            continue;
        }
        if !desc.is_empty() {
            desc.push('\n');
        }
        desc.push_str(cont);
    }
    out
}
