//! The buildfile parser.
//!
//! A recursive-descent parser over the mode-based lexer. Parsing happens
//! during the load phase and populates scopes with variables and targets.
//! Evaluation is interleaved with parsing: expansions are looked up and
//! functions called as names are parsed; short-circuited branches of
//! evaluation contexts are lexed in pre-parse mode (parsed but not
//! evaluated).

use std::sync::Arc;

use smallvec::smallvec;

use crate::{
    context::Context,
    diag::{self, Error, Location},
    file,
    lex::{LexMode, Lexer, Token, TokenKind},
    module,
    name::{Name, Names, ProjectName},
    path::{DirPath, path_match},
    scope::{self, ScopeId},
    target::{self, DIR, FILE, Prerequisite, Target, TargetKey},
    value::{self, Value, Values, ValueTypeId, EXTRA_APPEND, EXTRA_PREPEND},
    variable::VariableId,
};

/// One entry of a driver buildspec: `meta-op(op(target...))` with both
/// wrappers optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildspecEntry {
    pub meta_operation: Option<String>,
    pub operation: Option<String>,
    pub targets: Vec<String>,
}

/// Parse a driver buildspec (`update`, `clean(foo/ bar/)`,
/// `configure(update(./))`, plain targets, comma-separated entries).
pub fn parse_buildspec(text: &str) -> diag::Result<Vec<BuildspecEntry>> {
    let mut lexer = Lexer::new(text, "<buildspec>");
    lexer.push_mode(LexMode::Buildspec);

    let mut entries = Vec::new();
    let mut cur = BuildspecEntry::default();
    let mut depth = 0u8;
    let mut pending: Option<String> = None;

    loop {
        let t = lexer.next()?;
        match t.kind {
            TokenKind::Eos => break,
            TokenKind::Word => {
                if let Some(w) = pending.take() {
                    cur.targets.push(w);
                }
                pending = Some(t.value);
            }
            TokenKind::LParen => {
                let Some(w) = pending.take() else {
                    return Err(Error::parse(lexer.location(), "expected operation name before '('"));
                };
                match depth {
                    0 => cur.meta_operation = Some(w),
                    1 => cur.operation = Some(w),
                    _ => return Err(Error::parse(lexer.location(), "buildspec nesting too deep")),
                }
                depth += 1;
            }
            TokenKind::RParen => {
                if let Some(w) = pending.take() {
                    cur.targets.push(w);
                }
                if depth == 0 {
                    return Err(Error::parse(lexer.location(), "unbalanced ')' in buildspec"));
                }
                depth -= 1;
            }
            TokenKind::Comma => {
                if let Some(w) = pending.take() {
                    cur.targets.push(w);
                }
                entries.push(std::mem::take(&mut cur));
            }
            _ => {
                return Err(Error::parse(
                    lexer.location(),
                    format!("unexpected '{}' in buildspec", t.value),
                ));
            }
        }
    }
    if let Some(w) = pending.take() {
        cur.targets.push(w);
    }
    if cur != BuildspecEntry::default() {
        entries.push(cur);
    }
    // A meta-operation wrapper with no inner operation wrapper means the
    // single word was actually the operation: `update(./)`.
    for e in &mut entries {
        if e.operation.is_none() {
            if let Some(m) = &e.meta_operation {
                if crate::operation::parse_meta_operation(m).is_none() {
                    e.operation = e.meta_operation.take();
                }
            }
        }
    }
    // Unparenthesized operation words start a new entry each: `clean
    // update` is two opspecs over the default target.
    let mut result = Vec::new();
    for e in entries {
        if e.meta_operation.is_some() || e.operation.is_some() {
            result.push(e);
            continue;
        }
        let mut cur = BuildspecEntry::default();
        for w in e.targets {
            if crate::operation::parse_meta_operation(&w).is_some() && cur.meta_operation.is_none() && cur.targets.is_empty() {
                cur.meta_operation = Some(w);
            } else if crate::operation::parse_operation(&w).is_some() && cur.operation.is_none() && cur.targets.is_empty() {
                cur.operation = Some(w);
            } else if crate::operation::parse_operation(&w).is_some() || crate::operation::parse_meta_operation(&w).is_some() {
                result.push(std::mem::take(&mut cur));
                if crate::operation::parse_meta_operation(&w).is_some() {
                    cur.meta_operation = Some(w);
                } else {
                    cur.operation = Some(w);
                }
            } else {
                cur.targets.push(w);
            }
        }
        if cur != BuildspecEntry::default() {
            result.push(cur);
        }
    }
    Ok(result)
}

/// Parse a buildfile from text into the given root/base scopes.
pub fn parse_buildfile_text(
    ctx: &Arc<Context>,
    text: &str,
    path: &str,
    root: ScopeId,
    base: ScopeId,
) -> diag::Result<()> {
    let mut p = Parser::new(ctx, text, path, root, base);
    p.parse()
}

/// Parse buildfile text that assigns variables on a target (the
/// executable metadata protocol).
pub fn parse_metadata(
    ctx: &Arc<Context>,
    text: &str,
    path: &str,
    target: &Arc<Target>,
) -> diag::Result<()> {
    let root = {
        let s = ctx.scopes.get(target.base_scope);
        s.root().unwrap_or(target.base_scope)
    };
    let mut p = Parser::new(ctx, text, path, root, target.base_scope);
    p.target_block.push(target.id);
    p.parse_clause_only()
}

pub struct Parser<'c> {
    ctx: &'c Arc<Context>,
    lexer: Lexer,
    t: Token,
    /// Lex but do not evaluate (short-circuited eval branches).
    pre_parse: bool,
    pub root: ScopeId,
    pub scope: ScopeId,
    /// Targets whose variable block we are inside.
    pub target_block: Vec<crate::target::TargetId>,
    /// Targets declared in each scope, for the default `dir{}` targets.
    declared: Vec<(ScopeId, crate::target::TargetId)>,
}

impl<'c> Parser<'c> {
    pub fn new(ctx: &'c Arc<Context>, text: &str, path: &str, root: ScopeId, base: ScopeId) -> Self {
        let lexer = Lexer::new(text, path);
        Self {
            ctx,
            lexer,
            t: Token {
                kind: TokenKind::Newline,
                value: String::new(),
                line: 1,
                column: 1,
                separated: true,
                quoted: false,
            },
            pre_parse: false,
            root,
            scope: base,
            target_block: Vec::new(),
            declared: Vec::new(),
        }
    }

    /// Parse a complete buildfile and wire the default `dir{}` targets.
    pub fn parse(&mut self) -> diag::Result<()> {
        self.parse_clause_only()?;
        self.wire_default_targets()
    }

    fn parse_clause_only(&mut self) -> diag::Result<()> {
        self.next()?;
        self.parse_clause(false)?;
        if !self.t.is(TokenKind::Eos) {
            return Err(self.unexpected("at end of buildfile"));
        }
        Ok(())
    }

    fn next(&mut self) -> diag::Result<()> {
        self.t = self.lexer.next()?;
        Ok(())
    }

    fn loc(&self) -> Location {
        Location::new(self.lexer.path.clone(), self.t.line, self.t.column)
    }

    fn unexpected(&self, what: &str) -> Error {
        let shown = if self.t.value.is_empty() { self.t.kind.to_string() } else { self.t.value.clone() };
        Error::parse(self.loc(), format!("unexpected '{shown}' {what}"))
    }

    fn skip_newlines(&mut self) -> diag::Result<()> {
        while self.t.is(TokenKind::Newline) {
            self.next()?;
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Clauses
    // ----------------------------------------------------------------

    fn parse_clause(&mut self, in_block: bool) -> diag::Result<()> {
        loop {
            self.skip_newlines()?;
            match self.t.kind {
                TokenKind::Eos => return Ok(()),
                TokenKind::RCBrace if in_block => return Ok(()),
                TokenKind::Word => {
                    if self.parse_directive()? {
                        continue;
                    }
                    self.parse_statement()?;
                }
                TokenKind::LSBrace => {
                    // Attributes at statement position precede a variable
                    // assignment: `[uint64] x = ...` types the variable.
                    self.parse_typed_assignment()?;
                }
                _ => {
                    self.parse_statement()?;
                }
            }
        }
    }

    /// Dispatch a directive if the current word is one; returns false to
    /// fall through to statement parsing.
    fn parse_directive(&mut self) -> diag::Result<bool> {
        let w = self.t.value.clone();
        match w.as_str() {
            "print" => self.parse_print()?,
            "assert" | "assert!" => self.parse_assert(w.ends_with('!'))?,
            "if" | "if!" => self.parse_if_else(w.ends_with('!'))?,
            "include" => self.parse_include(false)?,
            "source" => self.parse_include(true)?,
            "import" | "import?" | "import!" => self.parse_import(&w)?,
            "export" => self.parse_export()?,
            "using" | "using?" => self.parse_using(w.ends_with('?'))?,
            "define" => self.parse_define()?,
            "dump" => self.parse_dump()?,
            "elif" | "elif!" | "else" => {
                return Err(Error::parse(self.loc(), format!("'{w}' without preceding 'if'")));
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// A statement: variable assignment or dependency declaration.
    fn parse_statement(&mut self) -> diag::Result<()> {
        let loc = self.loc();
        let (names, _) = self.parse_names()?;
        match self.t.kind {
            TokenKind::Assign | TokenKind::Append | TokenKind::Prepend => {
                let op = self.t.kind;
                let var = single_variable_name(&names, &loc)?;
                self.next()?;
                self.apply_variable_assignment(&var, op, None)
            }
            TokenKind::Colon => {
                self.next()?;
                self.parse_dependency(names, &loc)
            }
            TokenKind::Newline | TokenKind::Eos => {
                if names.is_empty() {
                    Ok(())
                } else {
                    Err(Error::parse(loc, "expected ':' or '=' after names"))
                }
            }
            _ => Err(self.unexpected("in statement")),
        }
    }

    /// `[type] var = value` — attributes before the variable name type
    /// the variable itself.
    fn parse_typed_assignment(&mut self) -> diag::Result<()> {
        let loc = self.loc();
        let (typ, null) = self.parse_attributes()?;
        if null {
            return Err(Error::parse(loc, "null attribute on a variable name"));
        }
        let (names, _) = self.parse_names()?;
        let var = single_variable_name(&names, &loc)?;
        if let Some(t) = typ {
            let mut pool = self.ctx.var_pool_mut();
            pool.insert_full(&var, Some(t), None, None)
                .map_err(|e| Error::semantic(e).at(loc.clone()))?;
        }
        match self.t.kind {
            TokenKind::Assign | TokenKind::Append | TokenKind::Prepend => {
                let op = self.t.kind;
                self.next()?;
                self.apply_variable_assignment(&var, op, None)
            }
            _ => Err(self.unexpected("after typed variable name")),
        }
    }

    // ----------------------------------------------------------------
    // Variable assignment
    // ----------------------------------------------------------------

    /// Parse the value side (attributes + value) and apply to the
    /// current assignment destination (scope, target block, or the
    /// given pattern/target override destination).
    fn apply_variable_assignment(
        &mut self,
        var_name: &str,
        op: TokenKind,
        dest: Option<AssignDest>,
    ) -> diag::Result<()> {
        let loc = self.loc();
        let (attr_typ, attr_null) = if self.t.is(TokenKind::LSBrace) {
            self.parse_attributes()?
        } else {
            (None, false)
        };

        self.lexer.push_mode(LexMode::Value);
        let (names, solo) = self.parse_names()?;
        self.end_of_line()?;

        if self.pre_parse {
            return Ok(());
        }
        let names = self.expand_patterns(names, &loc)?;

        let var = {
            let mut pool = self.ctx.var_pool_mut();
            pool.insert(var_name)
        };
        let vtyp = {
            let pool = self.ctx.var_pool();
            pool.get(var).typ
        };
        let typ = attr_typ.or(vtyp).or_else(|| solo.as_ref().and_then(|v| v.typ));

        let apply = |value: &mut Value| -> Result<(), String> {
            match op {
                TokenKind::Assign => {
                    if attr_null {
                        *value = match typ {
                            Some(t) => Value::null_typed(t),
                            None => Value::null_value(),
                        };
                        return Ok(());
                    }
                    if let Some(v) = &solo {
                        let mut nv = v.clone();
                        if let Some(t) = typ {
                            nv.typify(t)?;
                        }
                        nv.extra = value.extra;
                        *value = nv;
                        Ok(())
                    } else {
                        let extra = value.extra;
                        *value = Value::null_value();
                        value.extra = extra;
                        value.assign(names.clone(), typ)
                    }
                }
                TokenKind::Append => value.append(names.clone(), typ),
                TokenKind::Prepend => value.prepend(names.clone(), typ),
                _ => Err("unexpected assignment operator".to_owned()),
            }
        };

        let res = match dest {
            Some(AssignDest::Pattern { scope, typ: ttyp, pattern }) => {
                let s = self.ctx.scopes.get(scope);
                let pool = self.ctx.var_pool();
                let mut tv = s.target_vars.write();
                let entry = tv.entry(ttyp, &pattern).assign(&pool, var);
                let value = entry.modify();
                let r = apply(value);
                match op {
                    TokenKind::Append => value.extra |= EXTRA_APPEND,
                    TokenKind::Prepend => value.extra |= EXTRA_PREPEND,
                    _ => value.extra = 0,
                }
                r
            }
            Some(AssignDest::Target(tid)) => {
                let t = self.ctx.targets.get(tid);
                let pool = self.ctx.var_pool();
                let mut core = t.core.write();
                let entry = core.vars.assign(&pool, var);
                apply(entry.modify())
            }
            None => {
                if let Some(&tid) = self.target_block.last() {
                    let t = self.ctx.targets.get(tid);
                    let pool = self.ctx.var_pool();
                    let mut core = t.core.write();
                    let entry = core.vars.assign(&pool, var);
                    apply(entry.modify())
                } else {
                    let s = self.ctx.scopes.get(self.scope);
                    let pool = self.ctx.var_pool();
                    let mut vars = s.vars.write();
                    let entry = vars.assign(&pool, var);
                    apply(entry.modify())
                }
            }
        };
        res.map_err(|e| Error::semantic(format!("variable '{var_name}': {e}")).at(loc))
    }

    /// `[...]` attribute list: value type names and `null`.
    fn parse_attributes(&mut self) -> diag::Result<(Option<ValueTypeId>, bool)> {
        // t == '['
        self.lexer.push_mode(LexMode::Attributes);
        self.next()?;
        let mut typ = None;
        let mut null = false;
        loop {
            match self.t.kind {
                TokenKind::RSBrace => break,
                TokenKind::Comma => self.next()?,
                TokenKind::Word => {
                    let w = self.t.value.clone();
                    if w == "null" {
                        null = true;
                    } else if let Some(t) = value::find_type(&w) {
                        typ = Some(t);
                    } else {
                        return Err(Error::parse(self.loc(), format!("unknown value attribute '{w}'")));
                    }
                    self.next()?;
                }
                _ => return Err(self.unexpected("in attribute list")),
            }
        }
        self.lexer.pop_mode();
        self.next()?;
        Ok((typ, null))
    }

    fn end_of_line(&mut self) -> diag::Result<()> {
        match self.t.kind {
            TokenKind::Newline => self.next(),
            TokenKind::Eos => Ok(()),
            _ => Err(self.unexpected("at end of line")),
        }
    }

    // ----------------------------------------------------------------
    // Dependency declarations, target blocks, scope blocks
    // ----------------------------------------------------------------

    fn parse_dependency(&mut self, lhs: Names, loc: &Location) -> diag::Result<()> {
        if lhs.is_empty() {
            return Err(Error::parse(loc.clone(), "expected target before ':'"));
        }
        let (rhs, _) = self.parse_names()?;

        match self.t.kind {
            TokenKind::Assign | TokenKind::Append | TokenKind::Prepend => {
                // `targets: var = value` — target-specific (or pattern)
                // variable assignment.
                let op = self.t.kind;
                let var = single_variable_name(&rhs, loc)?;
                self.next()?;
                return self.apply_target_variables(&lhs, &var, op, loc);
            }
            TokenKind::Colon => {
                // `targets: prereqs: var = value` — prerequisite-specific
                // variables.
                self.next()?;
                let (pnames, _) = self.parse_names()?;
                let op = self.t.kind;
                if !matches!(op, TokenKind::Assign | TokenKind::Append | TokenKind::Prepend) {
                    return Err(self.unexpected("in prerequisite variable assignment"));
                }
                let var = single_variable_name(&pnames, loc)?;
                self.next()?;
                return self.apply_prereq_variables(&lhs, &rhs, &var, op, loc);
            }
            _ => {}
        }

        self.end_of_line()?;

        if self.pre_parse {
            return Ok(());
        }

        // Scope block: a single directory name with no prerequisites
        // followed by a brace block.
        let block_follows = self.t.is(TokenKind::LCBrace);
        if block_follows && rhs.is_empty() && lhs.len() == 1 && lhs[0].directory() {
            return self.parse_scope_block(&lhs[0]);
        }

        // Register targets and their prerequisites; wildcards expand
        // against the filesystem here, in declaration position.
        let lhs = self.expand_patterns(lhs, loc)?;
        let rhs = self.expand_patterns(rhs, loc)?;
        let mut targets = Vec::new();
        for n in &lhs {
            let t = self.enter_target(n, true, loc)?;
            self.declared.push((self.scope, t.id));
            targets.push(t);
        }
        let prereqs: Vec<Prerequisite> = rhs
            .iter()
            .filter(|n| !n.empty())
            .map(|n| self.enter_prereq(n, loc))
            .collect::<diag::Result<_>>()?;
        for t in &targets {
            let mut core = t.core.write();
            for p in &prereqs {
                core.prerequisites.push(clone_prereq(p));
            }
        }

        // Target block: variable assignments attaching to these targets.
        if block_follows {
            self.next()?;
            self.end_of_line()?;
            for t in &targets {
                self.target_block.push(t.id);
            }
            // Assignments inside apply to every listed target, so parse
            // once per target only when there are several would repeat
            // side effects; instead the block applies to the last pushed
            // set via a shared walk.
            self.parse_target_block(&targets)?;
            for _ in &targets {
                self.target_block.pop();
            }
            if !self.t.is(TokenKind::RCBrace) {
                return Err(self.unexpected("expected '}' at end of target block"));
            }
            self.next()?;
            self.end_of_line()?;
        }
        Ok(())
    }

    /// Variable assignments inside `{ }` after a dependency line; each
    /// assignment is applied to every declared target.
    fn parse_target_block(&mut self, targets: &[Arc<Target>]) -> diag::Result<()> {
        loop {
            self.skip_newlines()?;
            match self.t.kind {
                TokenKind::RCBrace | TokenKind::Eos => return Ok(()),
                _ => {
                    let loc = self.loc();
                    let (names, _) = self.parse_names()?;
                    match self.t.kind {
                        TokenKind::Assign | TokenKind::Append | TokenKind::Prepend => {
                            let op = self.t.kind;
                            let var = single_variable_name(&names, &loc)?;
                            self.next()?;
                            // Parse once; apply to the first target, then
                            // copy the entry to the others.
                            let first = targets.first().map(|t| t.id);
                            match first {
                                Some(tid) => {
                                    self.apply_variable_assignment(&var, op, Some(AssignDest::Target(tid)))?;
                                    self.copy_target_var(&var, targets)?;
                                }
                                None => {
                                    self.apply_variable_assignment(&var, op, None)?;
                                }
                            }
                        }
                        _ => return Err(self.unexpected("in target block")),
                    }
                }
            }
        }
    }

    fn copy_target_var(&mut self, var_name: &str, targets: &[Arc<Target>]) -> diag::Result<()> {
        if targets.len() < 2 {
            return Ok(());
        }
        let pool = self.ctx.var_pool();
        let Some(var) = pool.find(var_name) else { return Ok(()) };
        let first = self.ctx.targets.get(targets[0].id);
        let value = {
            let core = first.core.read();
            core.vars.lookup(&pool, var).map(|(e, _)| e.value.clone())
        };
        if let Some(v) = value {
            for t in &targets[1..] {
                t.core.write().vars.set(&pool, var, v.clone());
            }
        }
        Ok(())
    }

    fn parse_scope_block(&mut self, dir: &Name) -> diag::Result<()> {
        // t == '{'
        self.next()?;
        self.end_of_line()?;
        let saved = self.scope;
        self.scope = file::switch_scope(self.ctx, self.root, saved, &dir.dir)?;
        self.parse_clause(true)?;
        self.scope = saved;
        if !self.t.is(TokenKind::RCBrace) {
            return Err(self.unexpected("expected '}' at end of scope block"));
        }
        self.next()?;
        self.end_of_line()
    }

    fn apply_target_variables(
        &mut self,
        lhs: &Names,
        var: &str,
        op: TokenKind,
        loc: &Location,
    ) -> diag::Result<()> {
        // Patterns store the (incomplete) value in the scope's pattern
        // map; concrete targets get it directly.
        let mut dests = Vec::new();
        for n in lhs {
            if n.value.contains(['*', '?']) {
                let typ = self.name_target_type(n, loc)?;
                dests.push(AssignDest::Pattern {
                    scope: self.scope,
                    typ,
                    pattern: n.value.clone(),
                });
            } else {
                let t = self.enter_target(n, false, loc)?;
                dests.push(AssignDest::Target(t.id));
            }
        }
        // The value tokens can only be parsed once; apply to the first
        // destination, then replicate.
        let Some(first) = dests.first().cloned() else {
            return Err(Error::parse(loc.clone(), "expected target before ':'"));
        };
        self.apply_variable_assignment(var, op, Some(first.clone()))?;
        if dests.len() > 1 {
            self.replicate_assignment(&first, &dests[1..], var)?;
        }
        Ok(())
    }

    fn replicate_assignment(
        &mut self,
        first: &AssignDest,
        rest: &[AssignDest],
        var_name: &str,
    ) -> diag::Result<()> {
        let pool = self.ctx.var_pool();
        let Some(var) = pool.find(var_name) else { return Ok(()) };
        let value = match first {
            AssignDest::Target(tid) => {
                let t = self.ctx.targets.get(*tid);
                let core = t.core.read();
                core.vars.lookup(&pool, var).map(|(e, _)| e.value.clone())
            }
            AssignDest::Pattern { scope, typ, pattern } => {
                let s = self.ctx.scopes.get(*scope);
                let mut tv = s.target_vars.write();
                tv.entry(*typ, pattern).lookup(&pool, var).map(|(e, _)| e.value.clone())
            }
        };
        let Some(v) = value else { return Ok(()) };
        for d in rest {
            match d {
                AssignDest::Target(tid) => {
                    self.ctx.targets.get(*tid).core.write().vars.set(&pool, var, v.clone());
                }
                AssignDest::Pattern { scope, typ, pattern } => {
                    let s = self.ctx.scopes.get(*scope);
                    s.target_vars.write().entry(*typ, pattern).set(&pool, var, v.clone());
                }
            }
        }
        Ok(())
    }

    fn apply_prereq_variables(
        &mut self,
        lhs: &Names,
        rhs: &Names,
        var: &str,
        op: TokenKind,
        loc: &Location,
    ) -> diag::Result<()> {
        self.lexer.push_mode(LexMode::Value);
        let (names, solo) = self.parse_names()?;
        self.end_of_line()?;
        if self.pre_parse {
            return Ok(());
        }
        if op != TokenKind::Assign {
            return Err(Error::parse(
                loc.clone(),
                "prerequisite variables support only plain assignment",
            ));
        }
        let var_id = {
            let mut pool = self.ctx.var_pool_mut();
            pool.insert(var)
        };
        let value = match solo {
            Some(v) => v,
            None => Value::from_names(names),
        };
        for n in lhs {
            let t = self.enter_target(n, true, loc)?;
            self.declared.push((self.scope, t.id));
            let mut core = t.core.write();
            for pn in rhs.iter().filter(|n| !n.empty()) {
                let mut p = self.enter_prereq(pn, loc)?;
                {
                    let pool = self.ctx.var_pool();
                    p.vars.set(&pool, var_id, value.clone());
                }
                core.prerequisites.push(p);
            }
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Targets and prerequisites from names
    // ----------------------------------------------------------------

    fn name_target_type(&self, n: &Name, loc: &Location) -> diag::Result<crate::target::TargetTypeId> {
        if n.typed() {
            target::find_target_type(self.ctx, self.scope, &n.typ)
                .ok_or_else(|| Error::lookup(format!("unknown target type '{}'", n.typ)).at(loc.clone()))
        } else if n.directory() {
            Ok(DIR)
        } else {
            Ok(FILE)
        }
    }

    fn enter_target(&mut self, n: &Name, declared: bool, loc: &Location) -> diag::Result<Arc<Target>> {
        let typ = self.name_target_type(n, loc)?;
        let s = self.ctx.scopes.get(self.scope);
        let dir = if n.dir.is_absolute() { n.dir.clone() } else { s.out_path.join(n.dir.as_path()) };
        let (name, ext) = self.ctx.target_types().split_name(typ, &n.value);
        let key = TargetKey { typ, dir, out: DirPath::current(), name, ext };
        let (t, _) = self.ctx.targets.insert(self.ctx, key, !declared);
        Ok(t)
    }

    fn enter_prereq(&mut self, n: &Name, loc: &Location) -> diag::Result<Prerequisite> {
        let typ = self.name_target_type(n, loc)?;
        let (name, ext) = self.ctx.target_types().split_name(typ, &n.value);
        let mut p = Prerequisite::new(typ, n.dir.clone(), name, ext, self.scope);
        p.project = n.project.clone();
        Ok(p)
    }

    /// Each buildfile's declared targets become prerequisites of the
    /// scope's default `dir{}` target.
    fn wire_default_targets(&mut self) -> diag::Result<()> {
        use std::collections::BTreeMap;
        let mut by_scope: BTreeMap<ScopeId, Vec<crate::target::TargetId>> = BTreeMap::new();
        for (s, t) in std::mem::take(&mut self.declared) {
            by_scope.entry(s).or_default().push(t);
        }
        for (sid, tids) in by_scope {
            let s = self.ctx.scopes.get(sid);
            let key = TargetKey {
                typ: DIR,
                dir: s.out_path.clone(),
                out: DirPath::current(),
                name: String::new(),
                ext: None,
            };
            let (dir_t, _) = self.ctx.targets.insert(self.ctx, key, false);
            let mut core = dir_t.core.write();
            for tid in tids {
                if tid == dir_t.id {
                    continue;
                }
                let t = self.ctx.targets.get(tid);
                core.prerequisites.push(Prerequisite::new(
                    t.key.typ,
                    t.key.dir.clone(),
                    t.key.name.clone(),
                    t.key.ext.clone(),
                    sid,
                ));
            }
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Directives
    // ----------------------------------------------------------------

    fn parse_print(&mut self) -> diag::Result<()> {
        self.next()?;
        self.lexer.push_mode(LexMode::Value);
        let (names, solo) = self.parse_names()?;
        self.end_of_line()?;
        if self.pre_parse {
            return Ok(());
        }
        let text = match solo {
            Some(v) => v.display(),
            None => {
                let names = self.expand_patterns(names, &self.loc())?;
                crate::name::display_names(&names)
            }
        };
        self.ctx.diag.print(&text);
        Ok(())
    }

    fn parse_assert(&mut self, negated: bool) -> diag::Result<()> {
        let loc = self.loc();
        self.next()?;
        self.lexer.push_mode(LexMode::Value);
        let (cond_names, solo) = self.parse_names_first_unit()?;
        let (desc, _) = self.parse_names()?;
        self.end_of_line()?;
        if self.pre_parse {
            return Ok(());
        }
        let cond = match solo {
            Some(v) => v,
            None => Value::from_names(cond_names),
        };
        let b = cond
            .to_bool()
            .map_err(|e| Error::parse(loc.clone(), format!("assert condition: {e}")))?;
        if b == negated {
            let text = if desc.is_empty() {
                "assertion failed".to_owned()
            } else {
                crate::name::display_names(&desc)
            };
            return Err(Error::semantic(text).at(loc));
        }
        Ok(())
    }

    fn parse_if_else(&mut self, mut negated: bool) -> diag::Result<()> {
        let mut taken = false;
        loop {
            let is_else = self.t.value == "else";
            self.next()?;
            let take = if is_else {
                !taken
            } else {
                let loc = self.loc();
                self.lexer.push_mode(LexMode::Value);
                let skip = taken || self.pre_parse;
                let (names, solo) = self.with_pre_parse(skip, Self::parse_names)?;
                self.end_of_line()?;
                if skip {
                    false
                } else {
                    let v = solo.unwrap_or_else(|| Value::from_names(names));
                    let b = v
                        .to_bool()
                        .map_err(|e| Error::parse(loc, format!("if condition: {e}")))?;
                    b != negated
                }
            };
            self.skip_newlines()?;
            if !self.t.is(TokenKind::LCBrace) {
                return Err(self.unexpected("expected '{' after condition"));
            }
            if take {
                self.next()?;
                self.end_of_line()?;
                self.parse_clause(true)?;
                if !self.t.is(TokenKind::RCBrace) {
                    return Err(self.unexpected("expected '}' at end of block"));
                }
                self.next()?;
                taken = true;
            } else {
                self.skip_block()?;
            }
            // Chain detection.
            self.skip_newlines()?;
            if self.t.is(TokenKind::Word) {
                match self.t.value.as_str() {
                    "elif" => {
                        negated = false;
                        continue;
                    }
                    "elif!" => {
                        negated = true;
                        continue;
                    }
                    "else" => {
                        if is_else {
                            return Err(Error::parse(self.loc(), "'else' after 'else'"));
                        }
                        continue;
                    }
                    _ => {}
                }
            }
            return Ok(());
        }
    }

    /// Consume a brace-balanced block without interpreting it.
    fn skip_block(&mut self) -> diag::Result<()> {
        // t == '{'
        let mut depth = 0usize;
        loop {
            match self.t.kind {
                TokenKind::LCBrace => depth += 1,
                TokenKind::RCBrace => {
                    depth -= 1;
                    if depth == 0 {
                        self.next()?;
                        return Ok(());
                    }
                }
                TokenKind::Eos => {
                    return Err(Error::parse(self.loc(), "unterminated block"));
                }
                _ => {}
            }
            self.next()?;
        }
    }

    fn parse_include(&mut self, source_only: bool) -> diag::Result<()> {
        let loc = self.loc();
        self.next()?;
        self.lexer.push_mode(LexMode::Value);
        let (names, _) = self.parse_names()?;
        self.end_of_line()?;
        if self.pre_parse {
            return Ok(());
        }
        for n in &names {
            if source_only {
                file::source(self.ctx, self.root, self.scope, n, &loc)?;
            } else {
                file::include(self.ctx, self.root, self.scope, n, &loc)?;
            }
        }
        Ok(())
    }

    fn parse_import(&mut self, keyword: &str) -> diag::Result<()> {
        let optional = keyword.ends_with('?');
        let immediate = keyword.ends_with('!');
        let loc = self.loc();
        self.next()?;
        let metadata = if self.t.is(TokenKind::LSBrace) {
            let before = self.loc();
            let (typ, _) = self.parse_import_attributes()?;
            if !typ {
                return Err(Error::parse(before, "expected 'metadata' attribute"));
            }
            true
        } else {
            false
        };

        let (names, _) = self.parse_names()?;
        let assign_var = if matches!(self.t.kind, TokenKind::Assign) {
            let v = single_variable_name(&names, &loc)?;
            self.next()?;
            Some(v)
        } else {
            None
        };

        let import_names = if assign_var.is_some() {
            self.lexer.push_mode(LexMode::Value);
            let (ns, _) = self.parse_names()?;
            ns
        } else {
            names
        };
        self.end_of_line()?;
        if self.pre_parse {
            return Ok(());
        }

        let mut result = Names::new();
        for n in &import_names {
            let mut r = file::import(self.ctx, self.scope, n, optional, metadata, immediate, &loc)?;
            result.append(&mut r);
        }

        if let Some(vn) = assign_var {
            let var = {
                let mut pool = self.ctx.var_pool_mut();
                pool.insert(&vn)
            };
            let s = self.ctx.scopes.get(self.scope);
            let pool = self.ctx.var_pool();
            s.vars.write().set(&pool, var, Value::from_names(result));
        }
        Ok(())
    }

    /// The restricted attribute list accepted by `import`.
    fn parse_import_attributes(&mut self) -> diag::Result<(bool, ())> {
        self.lexer.push_mode(LexMode::Attributes);
        self.next()?;
        let mut metadata = false;
        loop {
            match self.t.kind {
                TokenKind::RSBrace => break,
                TokenKind::Comma => self.next()?,
                TokenKind::Word if self.t.value == "metadata" => {
                    metadata = true;
                    self.next()?;
                }
                _ => return Err(self.unexpected("in import attributes")),
            }
        }
        self.lexer.pop_mode();
        self.next()?;
        Ok((metadata, ()))
    }

    fn parse_export(&mut self) -> diag::Result<()> {
        self.next()?;
        self.lexer.push_mode(LexMode::Value);
        let (names, _) = self.parse_names()?;
        self.end_of_line()?;
        if self.pre_parse {
            return Ok(());
        }
        *self.ctx.export_stash.lock() = Some(names);
        Ok(())
    }

    fn parse_using(&mut self, optional: bool) -> diag::Result<()> {
        let loc = self.loc();
        self.next()?;
        let (names, _) = self.parse_names()?;
        self.end_of_line()?;
        if self.pre_parse {
            return Ok(());
        }
        for n in &names {
            if !n.simple() {
                return Err(Error::parse(loc.clone(), format!("invalid module name '{n}'")));
            }
            module::load(self.ctx, self.root, self.scope, &n.value, optional, &loc)?;
        }
        Ok(())
    }

    fn parse_define(&mut self) -> diag::Result<()> {
        let loc = self.loc();
        self.next()?;
        if !self.t.is(TokenKind::Word) {
            return Err(self.unexpected("expected new target type name"));
        }
        let name = self.t.value.clone();
        self.next()?;
        if !self.t.is(TokenKind::Colon) {
            return Err(self.unexpected("expected ':' in define"));
        }
        self.next()?;
        if !self.t.is(TokenKind::Word) {
            return Err(self.unexpected("expected base target type name"));
        }
        let base_name = self.t.value.clone();
        self.next()?;
        self.end_of_line()?;
        if self.pre_parse {
            return Ok(());
        }

        let base = target::find_target_type(self.ctx, self.scope, &base_name)
            .ok_or_else(|| Error::lookup(format!("unknown target type '{base_name}'")).at(loc.clone()))?;
        let derived = {
            let mut tt = self.ctx.target_types_mut();
            tt.derive(&name, base)
        };
        let Some(id) = derived else {
            return Err(Error::semantic(format!("target type '{name}' is already defined")).at(loc));
        };
        let s = self.ctx.scopes.get(self.scope);
        s.target_types.write().insert(name, id);
        Ok(())
    }

    fn parse_dump(&mut self) -> diag::Result<()> {
        self.next()?;
        self.end_of_line()?;
        if self.pre_parse {
            return Ok(());
        }
        let text = crate::dump::dump_scope_text(self.ctx, self.scope)?;
        for line in text.lines() {
            self.ctx.diag.print(line);
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Names
    // ----------------------------------------------------------------

    /// Parse names until a terminator (not consumed). The second half of
    /// the pair is `Some(value)` when the whole production was exactly
    /// one expansion — the case where a typed value passes through
    /// unreversed.
    fn parse_names(&mut self) -> diag::Result<(Names, Option<Value>)> {
        self.parse_names_impl(false)
    }

    /// As `parse_names`, but stop after the first whitespace-separated
    /// unit (the `assert` condition).
    fn parse_names_first_unit(&mut self) -> diag::Result<(Names, Option<Value>)> {
        self.parse_names_impl(true)
    }

    fn parse_names_impl(&mut self, first_only: bool) -> diag::Result<(Names, Option<Value>)> {
        let mut names = Names::new();
        let mut solo: Option<Value> = None;
        let mut units = 0usize;

        loop {
            match self.t.kind {
                TokenKind::Word | TokenKind::Dollar | TokenKind::LCBrace | TokenKind::LParen => {
                    let (mut unit, unit_solo) = self.parse_unit()?;
                    units += 1;
                    solo = if units == 1 && names.is_empty() { unit_solo } else { None };
                    names.append(&mut unit);
                    if first_only {
                        break;
                    }
                }
                TokenKind::PairSeparator => {
                    if names.is_empty() {
                        return Err(self.unexpected("at start of name"));
                    }
                    solo = None;
                    if let Some(last) = names.last_mut() {
                        last.pair = b'@';
                    }
                    self.next()?;
                    // An empty second half is allowed (`foo@`).
                    if !matches!(self.t.kind, TokenKind::Word | TokenKind::Dollar | TokenKind::LCBrace)
                        || self.t.separated
                    {
                        names.push(Name::default());
                    }
                }
                _ => break,
            }
        }
        Ok((names, solo))
    }

    /// One whitespace-separated unit: adjacent words, expansions, and
    /// brace groups concatenate or cross.
    fn parse_unit(&mut self) -> diag::Result<(Names, Option<Value>)> {
        let loc = self.loc();
        let mut text = String::new();
        let mut quoted = false;
        let mut value_chunks = 0usize;
        let mut lone_value: Option<Value> = None;

        loop {
            match self.t.kind {
                TokenKind::Word => {
                    text.push_str(&self.t.value);
                    quoted = quoted || self.t.quoted;
                    lone_value = None;
                    self.next()?;
                }
                TokenKind::Dollar => {
                    let v = self.parse_expansion()?;
                    value_chunks += 1;
                    if text.is_empty() && value_chunks == 1 {
                        lone_value = Some(v.clone());
                    } else {
                        lone_value = None;
                    }
                    // Concatenation renders through the value's names.
                    let ns = v.reverse();
                    match ns.len() {
                        0 => {}
                        1 => text.push_str(&name_to_text(&ns[0])),
                        _ => {
                            if self.t.separated || terminator(self.t.kind) {
                                if text.is_empty() && value_chunks == 1 {
                                    // A lone multi-name expansion splices.
                                    return Ok((ns, lone_value));
                                }
                            }
                            return Err(Error::parse(
                                loc,
                                "concatenating expansion yields multiple names",
                            ));
                        }
                    }
                }
                TokenKind::LParen => {
                    let v = self.parse_eval()?;
                    value_chunks += 1;
                    if text.is_empty() && value_chunks == 1 {
                        lone_value = Some(v.clone());
                    } else {
                        lone_value = None;
                    }
                    let ns = v.reverse();
                    match ns.len() {
                        0 => {}
                        1 => text.push_str(&name_to_text(&ns[0])),
                        _ => {
                            if (self.t.separated || terminator(self.t.kind)) && text.is_empty() && value_chunks == 1 {
                                return Ok((ns, lone_value));
                            }
                            return Err(Error::parse(
                                loc,
                                "concatenating evaluation yields multiple names",
                            ));
                        }
                    }
                }
                TokenKind::LCBrace => {
                    return self.parse_group(std::mem::take(&mut text), &loc).map(|ns| (ns, None));
                }
                _ => break,
            }
            if self.t.separated || terminator(self.t.kind) {
                break;
            }
        }

        if let Some(v) = lone_value {
            let ns = v.reverse();
            return Ok((ns, Some(v)));
        }
        if text.is_empty() && value_chunks > 0 {
            return Ok((Names::new(), None));
        }
        let ns = self.process_word_text(&text, quoted, &loc)?;
        Ok((ns, None))
    }

    /// `prefix{inner...}` groups with cross products. The prefix splits
    /// into a directory part and a type part. Wildcards stay unexpanded
    /// here; the use site decides (a pattern on the left of a variable
    /// assignment is a pattern, not a glob).
    fn parse_group(&mut self, prefix: String, loc: &Location) -> diag::Result<Names> {
        // t == '{'
        let mut result = self.parse_group_inner()?;
        result = apply_group_prefix(&prefix, result, loc)?;

        // Crossing: `a{b c}{d e}`.
        while self.t.is(TokenKind::LCBrace) && !self.t.separated {
            let rhs = self.parse_group_inner()?;
            let mut crossed = Names::new();
            for l in &result {
                for r in &rhs {
                    let mut n = r.clone();
                    let mut dir = l.dir.clone();
                    if !l.value.is_empty() {
                        dir = dir.join(&l.value);
                    }
                    n.dir = dir.join(n.dir.as_path());
                    if n.project.is_none() {
                        n.project = l.project.clone();
                    }
                    crossed.push(n);
                }
            }
            result = crossed;
        }
        Ok(result)
    }

    fn parse_group_inner(&mut self) -> diag::Result<Names> {
        // t == '{'
        self.next()?;
        let mut names = Names::new();
        loop {
            self.skip_newlines()?;
            match self.t.kind {
                TokenKind::RCBrace => {
                    self.next()?;
                    return Ok(names);
                }
                TokenKind::Eos => {
                    return Err(Error::parse(self.loc(), "unterminated '{'"));
                }
                _ => {
                    let (mut unit, _) = self.parse_unit()?;
                    if unit.is_empty() && !matches!(self.t.kind, TokenKind::RCBrace) {
                        return Err(self.unexpected("in name group"));
                    }
                    names.append(&mut unit);
                    if self.t.is(TokenKind::PairSeparator) {
                        if let Some(last) = names.last_mut() {
                            last.pair = b'@';
                        }
                        self.next()?;
                    }
                }
            }
        }
    }

    /// Process a word's text into names: project qualification, directory
    /// splitting, trailing-slash directories, and wildcard expansion.
    fn process_word_text(&mut self, text: &str, quoted: bool, loc: &Location) -> diag::Result<Names> {
        if text.is_empty() {
            if quoted {
                return Ok(vec![Name::default()]);
            }
            return Ok(Names::new());
        }

        let (project, rest) = split_project(text, loc)?;
        let mut n = text_to_name(rest);
        n.project = project;
        Ok(vec![n])
    }

    /// Expand wildcard names against the filesystem, honoring `-`
    /// exclusions and `+` forced inclusions in the same group. Without a
    /// wildcard present the names pass through untouched (`-DFOO` is an
    /// option, not an exclusion).
    fn expand_patterns(&mut self, names: Names, _loc: &Location) -> diag::Result<Names> {
        if self.pre_parse || !names.iter().any(Name::is_pattern) {
            return Ok(names);
        }
        let src_base = {
            let s = self.ctx.scopes.get(self.scope);
            s.src_path().unwrap_or_else(|| s.out_path.clone())
        };

        let mut included = Names::new();
        let mut excludes: Vec<String> = Vec::new();
        for n in &names {
            if let Some(stripped) = n.value.strip_prefix('-') {
                excludes.push(stripped.to_owned());
            } else if let Some(stripped) = n.value.strip_prefix('+') {
                let mut m = n.clone();
                m.value = stripped.to_owned();
                included.push(m);
            } else if n.is_pattern() {
                included.extend(self.match_pattern(n, &src_base));
            } else {
                included.push(n.clone());
            }
        }
        if !excludes.is_empty() {
            included.retain(|n| !excludes.iter().any(|e| path_match(e, &n.value) || *e == n.value));
        }
        Ok(included)
    }

    /// Match one pattern name against the source directory, completing
    /// the default extension of the name's target type (the pattern
    /// amender).
    fn match_pattern(&self, n: &Name, src_base: &DirPath) -> Names {
        let mut pattern = n.value.clone();
        if n.typed() && !pattern.contains('.') {
            if let Some(t) = target::find_target_type(self.ctx, self.scope, &n.typ) {
                if let Some(e) = &self.ctx.target_types().get(t).default_ext {
                    if !e.is_empty() {
                        pattern = format!("{pattern}.{e}");
                    }
                }
            }
        }
        let dir = src_base.join(n.dir.as_path());
        let recursive = pattern.contains("**");
        let mut out = Names::new();
        let mut stack = vec![(dir.clone(), String::new())];
        while let Some((d, rel)) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(d.as_path()) else { continue };
            let mut items: Vec<_> = entries.flatten().collect();
            items.sort_by_key(std::fs::DirEntry::file_name);
            for e in items {
                let fname = e.file_name().to_string_lossy().into_owned();
                let rel_name = if rel.is_empty() { fname.clone() } else { format!("{rel}/{fname}") };
                let is_dir = e.file_type().is_ok_and(|t| t.is_dir());
                if is_dir && recursive {
                    stack.push((d.join(&fname), rel_name.clone()));
                }
                let candidate = if recursive { rel_name.as_str() } else { fname.as_str() };
                if is_dir != pattern.ends_with('/') {
                    continue;
                }
                let pat = pattern.trim_end_matches('/');
                if path_match(pat, candidate) {
                    let mut m = n.clone();
                    if is_dir {
                        m.value = String::new();
                        m.dir = n.dir.join(candidate);
                    } else {
                        m.value = candidate.to_owned();
                    }
                    out.push(m);
                }
            }
        }
        out
    }

    // ----------------------------------------------------------------
    // Expansion and evaluation
    // ----------------------------------------------------------------

    /// `$name`, `$f(args)`, or `$(expr)`; the current token is the
    /// dollar. On return the current token is the one after the
    /// expansion.
    fn parse_expansion(&mut self) -> diag::Result<Value> {
        let loc = self.loc();
        if self.lexer.next_char_is('(') {
            self.next()?; // now '('
            return self.parse_eval();
        }
        self.lexer.push_mode(LexMode::Variable);
        self.next()?;
        let name = self.t.value.clone();
        self.next()?;

        // Unseparated '(' makes it a function call.
        if self.t.is(TokenKind::LParen) && !self.t.separated {
            let args = self.parse_function_args()?;
            if self.pre_parse {
                return Ok(Value::from_names(Names::new()));
            }
            return self.ctx.functions.call(self.ctx, &name, &loc, args);
        }

        if self.pre_parse {
            return Ok(Value::from_names(Names::new()));
        }
        self.expand_variable(&name, &loc)
    }

    fn expand_variable(&mut self, name: &str, loc: &Location) -> diag::Result<Value> {
        let var = {
            let pool = self.ctx.var_pool();
            pool.find(name)
        };
        let Some(var) = var else {
            // Undefined lookups expand to an empty (NULL) value.
            return Ok(Value::null_value());
        };
        let l = self.lookup(var).map_err(|e| e.at(loc.clone()))?;
        Ok(l.value.unwrap_or_else(Value::null_value))
    }

    fn lookup(&self, var: VariableId) -> diag::Result<scope::Lookup> {
        if let Some(&tid) = self.target_block.last() {
            let t = self.ctx.targets.get(tid);
            return t.find_var(self.ctx, var);
        }
        scope::find(self.ctx, self.scope, var)
    }

    /// Function call arguments: comma-separated full expressions.
    fn parse_function_args(&mut self) -> diag::Result<Values> {
        // t == '('
        self.lexer.push_mode(LexMode::Eval);
        self.next()?;
        let mut args: Values = smallvec![];
        if self.t.is(TokenKind::RParen) {
            self.lexer.pop_mode();
            self.next()?;
            return Ok(args);
        }
        loop {
            let v = self.parse_eval_ternary(!self.pre_parse)?;
            args.push(v);
            match self.t.kind {
                TokenKind::Comma => self.next()?,
                TokenKind::RParen => break,
                _ => return Err(self.unexpected("in function arguments")),
            }
        }
        self.lexer.pop_mode();
        self.next()?;
        Ok(args)
    }

    /// An evaluation context `( ... )`; the current token is the opening
    /// parenthesis. On return the current token follows the `)`.
    fn parse_eval(&mut self) -> diag::Result<Value> {
        self.lexer.push_mode(LexMode::Eval);
        self.next()?;
        let v = self.parse_eval_ternary(!self.pre_parse)?;
        if !self.t.is(TokenKind::RParen) {
            return Err(self.unexpected("in evaluation context"));
        }
        self.lexer.pop_mode();
        self.next()?;
        Ok(v)
    }

    fn parse_eval_ternary(&mut self, eval: bool) -> diag::Result<Value> {
        let cond = self.parse_eval_or(eval)?;
        if !self.t.is(TokenKind::Question) {
            return Ok(cond);
        }
        let loc = self.loc();
        let b = if eval {
            cond.to_bool().map_err(|e| Error::parse(loc.clone(), e))?
        } else {
            false
        };
        self.next()?;
        let lhs = self.with_pre_parse(!(eval && b), |p| p.parse_eval_ternary(eval && b))?;
        if !self.t.is(TokenKind::Colon) {
            return Err(self.unexpected("expected ':' in ternary"));
        }
        self.next()?;
        let rhs = self.with_pre_parse(!(eval && !b), |p| p.parse_eval_ternary(eval && !b))?;
        if !eval {
            return Ok(Value::from_names(Names::new()));
        }
        Ok(if b { lhs } else { rhs })
    }

    fn with_pre_parse<T>(
        &mut self,
        pre: bool,
        f: impl FnOnce(&mut Self) -> diag::Result<T>,
    ) -> diag::Result<T> {
        let saved = self.pre_parse;
        self.pre_parse = saved || pre;
        let r = f(self);
        self.pre_parse = saved;
        r
    }

    fn parse_eval_or(&mut self, eval: bool) -> diag::Result<Value> {
        let first = self.parse_eval_and(eval)?;
        if !self.t.is(TokenKind::LogOr) {
            return Ok(first);
        }
        let loc = self.loc();
        let mut b = if eval {
            first.to_bool().map_err(|e| Error::parse(loc.clone(), e))?
        } else {
            false
        };
        while self.t.is(TokenKind::LogOr) {
            self.next()?;
            let rhs_eval = eval && !b;
            let rhs = self.with_pre_parse(!rhs_eval, |p| p.parse_eval_and(rhs_eval))?;
            if rhs_eval {
                b = rhs.to_bool().map_err(|e| Error::parse(loc.clone(), e))?;
            }
        }
        Ok(Value::from_bool(b))
    }

    fn parse_eval_and(&mut self, eval: bool) -> diag::Result<Value> {
        let first = self.parse_eval_comp(eval)?;
        if !self.t.is(TokenKind::LogAnd) {
            return Ok(first);
        }
        let loc = self.loc();
        let mut b = if eval {
            first.to_bool().map_err(|e| Error::parse(loc.clone(), e))?
        } else {
            true
        };
        while self.t.is(TokenKind::LogAnd) {
            self.next()?;
            let rhs_eval = eval && b;
            let rhs = self.with_pre_parse(!rhs_eval, |p| p.parse_eval_comp(rhs_eval))?;
            if rhs_eval {
                b = rhs.to_bool().map_err(|e| Error::parse(loc.clone(), e))?;
            }
        }
        Ok(Value::from_bool(b))
    }

    fn parse_eval_comp(&mut self, eval: bool) -> diag::Result<Value> {
        let lhs = self.parse_eval_value(eval)?;
        let op = match self.t.kind {
            TokenKind::Equal
            | TokenKind::NotEqual
            | TokenKind::Less
            | TokenKind::Greater
            | TokenKind::LessEqual
            | TokenKind::GreaterEqual => self.t.kind,
            _ => return Ok(lhs),
        };
        let loc = self.loc();
        self.next()?;
        let rhs = self.parse_eval_value(eval)?;
        if !eval {
            return Ok(Value::from_names(Names::new()));
        }
        let (l, r) = promote(lhs, rhs).map_err(|e| Error::parse(loc, e))?;
        let ord = l.compare(&r);
        let b = match op {
            TokenKind::Equal => ord == std::cmp::Ordering::Equal,
            TokenKind::NotEqual => ord != std::cmp::Ordering::Equal,
            TokenKind::Less => ord == std::cmp::Ordering::Less,
            TokenKind::Greater => ord == std::cmp::Ordering::Greater,
            TokenKind::LessEqual => ord != std::cmp::Ordering::Greater,
            TokenKind::GreaterEqual => ord != std::cmp::Ordering::Less,
            _ => false,
        };
        Ok(Value::from_bool(b))
    }

    fn parse_eval_value(&mut self, eval: bool) -> diag::Result<Value> {
        match self.t.kind {
            TokenKind::LogNot => {
                let loc = self.loc();
                self.next()?;
                let v = self.parse_eval_value(eval)?;
                if !eval {
                    return Ok(Value::from_names(Names::new()));
                }
                let b = v.to_bool().map_err(|e| Error::parse(loc, e))?;
                Ok(Value::from_bool(!b))
            }
            TokenKind::LParen => self.with_pre_parse(!eval, Self::parse_eval),
            _ => {
                let (names, solo) = self.with_pre_parse(!eval, Self::parse_names)?;
                Ok(match solo {
                    Some(v) => v,
                    None => Value::from_names(names),
                })
            }
        }
    }
}

fn clone_prereq(p: &Prerequisite) -> Prerequisite {
    let mut n = Prerequisite::new(p.typ, p.dir.clone(), p.name.clone(), p.ext.clone(), p.scope);
    n.project = p.project.clone();
    n.out = p.out.clone();
    n.vars = p.vars.clone();
    n
}

#[derive(Debug, Clone)]
enum AssignDest {
    Target(crate::target::TargetId),
    Pattern { scope: ScopeId, typ: crate::target::TargetTypeId, pattern: String },
}

fn terminator(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Newline
            | TokenKind::Eos
            | TokenKind::Colon
            | TokenKind::Assign
            | TokenKind::Append
            | TokenKind::Prepend
            | TokenKind::RCBrace
            | TokenKind::RParen
            | TokenKind::RSBrace
            | TokenKind::Comma
            | TokenKind::Question
            | TokenKind::PairSeparator
            | TokenKind::Equal
            | TokenKind::NotEqual
            | TokenKind::Less
            | TokenKind::Greater
            | TokenKind::LessEqual
            | TokenKind::GreaterEqual
            | TokenKind::LogAnd
            | TokenKind::LogOr
    )
}

fn single_variable_name(names: &Names, loc: &Location) -> diag::Result<String> {
    if names.len() == 1 && names[0].simple() && !names[0].value.is_empty() {
        return Ok(names[0].value.clone());
    }
    Err(Error::parse(
        loc.clone(),
        format!("expected variable name, got '{}'", crate::name::display_names(names)),
    ))
}

/// Split the optional `proj%` qualification. `%name` means qualified
/// with no specific project.
fn split_project<'a>(text: &'a str, loc: &Location) -> diag::Result<(Option<ProjectName>, &'a str)> {
    match text.find('%') {
        None => Ok((None, text)),
        Some(0) => Ok((Some(ProjectName::unspecified()), &text[1..])),
        Some(i) => {
            let p = ProjectName::new(&text[..i]).map_err(|e| Error::parse(loc.clone(), e))?;
            Ok((Some(p), &text[i + 1..]))
        }
    }
}

/// Text to a (dir, value) name: a trailing slash is a directory, a
/// contained slash splits off the directory part.
fn text_to_name(text: &str) -> Name {
    if text.ends_with('/') {
        return Name::from_dir(DirPath::new(text));
    }
    match text.rfind('/') {
        Some(i) => Name {
            project: None,
            dir: DirPath::new(&text[..=i]),
            typ: String::new(),
            value: text[i + 1..].to_owned(),
            pair: 0,
        },
        None => Name::from_value(text),
    }
}

/// Render a name back to word text for concatenation.
fn name_to_text(n: &Name) -> String {
    let mut s = String::new();
    if let Some(p) = &n.project {
        s.push_str(p.as_str());
        s.push('%');
    }
    if !n.dir.is_empty() {
        s.push_str(&n.dir.to_string());
    }
    s.push_str(&n.value);
    s
}

/// Apply a group prefix (`dir/type`) to the names inside the braces.
fn apply_group_prefix(prefix: &str, names: Names, loc: &Location) -> diag::Result<Names> {
    let (project, rest) = split_project(prefix, loc)?;
    let (dir, typ) = match rest.rfind('/') {
        Some(i) => (DirPath::new(&rest[..=i]), &rest[i + 1..]),
        None => (DirPath::current(), rest),
    };
    let mut out = Names::with_capacity(names.len());
    for mut n in names {
        if !typ.is_empty() {
            if n.typed() {
                return Err(Error::parse(
                    loc.clone(),
                    format!("nested target type '{}' in {typ}{{}}", n.typ),
                ));
            }
            n.typ = typ.to_owned();
        }
        if !dir.is_empty() {
            n.dir = dir.join(n.dir.as_path());
        }
        if n.project.is_none() {
            n.project = project.clone();
        }
        out.push(n);
    }
    Ok(out)
}

/// Comparison promotion: the untyped side converts to the typed side's
/// type.
fn promote(l: Value, r: Value) -> Result<(Value, Value), String> {
    match (l.typ, r.typ) {
        (Some(t), None) => {
            let r = r.coerce(t)?;
            Ok((l, r))
        }
        (None, Some(t)) => {
            let l = l.coerce(t)?;
            Ok((l, r))
        }
        _ => Ok((l, r)),
    }
}
