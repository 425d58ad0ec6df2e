//! Lenient markup parser into an index-addressed node arena, plus absolute
//! path generation and a small locator evaluator.
//!
//! Nodes are addressed by [`NodeId`], assigned during parsing. The parser
//! never fails: unknown constructs are skipped, unmatched end tags are
//! ignored and missing `html`/`body` wrappers are synthesized so that
//! generated paths look like the ones a browser would resolve.
//!
//! Supported locator forms:
//! - absolute and relative-descendant paths: `/html/body/form/input[2]`,
//!   `//div[@class='box']//button`, `//*[@id="x"]`
//! - predicates: position `[n]`, `[@attr]`, `[@attr='v']`, `[text()='v']`,
//!   `[contains(@attr,'v')]`, `[contains(text(),'v')]`
//! - grouped position: `(//input)[3]`

use thiserror::Error;

/// Elements that never have children.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Elements whose content is not markup.
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct Element {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Document,
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LocatorError {
    #[error("unsupported locator syntax at offset {offset} in {locator:?}")]
    Unsupported { locator: String, offset: usize },
}

/// A parsed markup document.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    /// Pre-order position of every node, indexed by `NodeId`.
    order: Vec<usize>,
}

impl Document {
    pub fn parse(markup: &str) -> Self {
        let mut doc = Self {
            nodes: vec![Node {
                kind: NodeKind::Document,
                parent: None,
                children: Vec::new(),
            }],
            order: Vec::new(),
        };
        Parser::new(markup, &mut doc).run();
        doc.ensure_html_root();
        doc.compute_order();
        doc
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match &self.nodes[id.0].kind {
            NodeKind::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn tag(&self, id: NodeId) -> Option<&str> {
        self.element(id).map(|el| el.tag.as_str())
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.element(id)?
            .attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_attr(&self, id: NodeId, name: &str) -> bool {
        self.attr(id, name).is_some()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    /// Parent, if it is an element (the document node is not).
    pub fn parent_element(&self, id: NodeId) -> Option<NodeId> {
        self.parent(id).filter(|p| self.element(*p).is_some())
    }

    pub fn element_children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[id.0]
            .children
            .iter()
            .copied()
            .filter(move |c| self.element(*c).is_some())
    }

    /// Element ancestors, nearest first.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.parent_element(id), move |p| self.parent_element(*p))
    }

    /// Descendant elements in document order, excluding `id` itself.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes[id.0].children.iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            if self.element(next).is_some() {
                out.push(next);
            }
            stack.extend(self.nodes[next.0].children.iter().rev().copied());
        }
        out
    }

    /// All elements with the given tag, in document order.
    pub fn elements_by_tag(&self, tag: &str) -> Vec<NodeId> {
        self.descendants(self.root())
            .into_iter()
            .filter(|id| self.tag(*id) == Some(tag))
            .collect()
    }

    /// Text that precedes the first child element, if any.
    pub fn own_text(&self, id: NodeId) -> Option<&str> {
        let first = self.nodes[id.0].children.first()?;
        match &self.nodes[first.0].kind {
            NodeKind::Text(t) => Some(t.as_str()),
            _ => None,
        }
    }

    /// All direct text children joined together.
    pub fn direct_text(&self, id: NodeId) -> String {
        self.nodes[id.0]
            .children
            .iter()
            .filter_map(|c| match &self.nodes[c.0].kind {
                NodeKind::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Absolute path such as `/html/body/form/input[2]`. A position is only
    /// emitted when the parent has more than one child with the same tag.
    pub fn absolute_path(&self, id: NodeId) -> String {
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(node) = current {
            let Some(tag) = self.tag(node) else { break };
            let parent = self.parent(node).unwrap_or(self.root());
            let same_tag: Vec<NodeId> = self
                .element_children(parent)
                .filter(|c| self.tag(*c) == Some(tag))
                .collect();
            if same_tag.len() > 1 {
                let pos = same_tag.iter().position(|c| *c == node).unwrap_or(0) + 1;
                segments.push(format!("{}[{}]", tag, pos));
            } else {
                segments.push(tag.to_string());
            }
            current = self.parent_element(node);
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }

    /// Evaluate a locator and return matching elements in document order.
    pub fn select(&self, locator: &str) -> Result<Vec<NodeId>, LocatorError> {
        let expr = LocatorParser::new(locator).parse()?;
        let mut matched = self.eval_steps(&expr.steps);
        if let Some(index) = expr.group_index {
            matched = index
                .checked_sub(1)
                .and_then(|i| matched.into_iter().nth(i))
                .into_iter()
                .collect();
        }
        Ok(matched)
    }

    fn eval_steps(&self, steps: &[Step]) -> Vec<NodeId> {
        let mut context = vec![self.root()];
        for step in steps {
            let mut next: Vec<NodeId> = Vec::new();
            for ctx in &context {
                let candidates: Vec<NodeId> = if step.descendant {
                    self.descendants(*ctx)
                } else {
                    self.element_children(*ctx).collect()
                };
                for candidate in candidates {
                    if self.step_matches(step, candidate) && !next.contains(&candidate) {
                        next.push(candidate);
                    }
                }
            }
            next.sort_by_key(|id| self.order[id.0]);
            context = next;
        }
        context
    }

    fn step_matches(&self, step: &Step, id: NodeId) -> bool {
        if !step.name_matches(self.tag(id)) {
            return false;
        }
        step.predicates
            .iter()
            .enumerate()
            .all(|(i, pred)| self.predicate_matches(step, i, pred, id))
    }

    fn predicate_matches(&self, step: &Step, index: usize, pred: &Predicate, id: NodeId) -> bool {
        match pred {
            Predicate::Position(n) => {
                // Position counts siblings that pass the name test and every
                // earlier predicate of this step.
                let parent = self.parent(id).unwrap_or(self.root());
                let position = self
                    .element_children(parent)
                    .filter(|sib| {
                        step.name_matches(self.tag(*sib))
                            && step.predicates[..index]
                                .iter()
                                .enumerate()
                                .all(|(j, p)| self.predicate_matches(step, j, p, *sib))
                    })
                    .position(|sib| sib == id);
                position.map(|p| p + 1) == Some(*n)
            }
            Predicate::HasAttr(name) => self.has_attr(id, name),
            Predicate::AttrEq(name, value) => self.attr(id, name) == Some(value.as_str()),
            Predicate::AttrContains(name, value) => {
                self.attr(id, name).is_some_and(|v| v.contains(value.as_str()))
            }
            Predicate::TextEq(value) => self.text_children(id).any(|t| t == value),
            Predicate::TextContains(value) => self.text_children(id).any(|t| t.contains(value.as_str())),
        }
    }

    fn text_children(&self, id: NodeId) -> impl Iterator<Item = &str> + '_ {
        self.nodes[id.0].children.iter().filter_map(|c| match &self.nodes[c.0].kind {
            NodeKind::Text(t) => Some(t.as_str()),
            _ => None,
        })
    }

    fn push(&mut self, kind: NodeKind, parent: NodeId) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            kind,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    fn new_element(&mut self, tag: &str, parent: NodeId) -> NodeId {
        self.push(
            NodeKind::Element(Element {
                tag: tag.to_string(),
                attrs: Vec::new(),
            }),
            parent,
        )
    }

    fn reparent(&mut self, children: Vec<NodeId>, new_parent: NodeId) {
        for child in children {
            self.nodes[child.0].parent = Some(new_parent);
            self.nodes[new_parent.0].children.push(child);
        }
    }

    fn ensure_html_root(&mut self) {
        let root = self.root();
        let html = self.element_children(root).find(|c| self.tag(*c) == Some("html"));

        let html = match html {
            Some(html) => html,
            None => {
                let content = std::mem::take(&mut self.nodes[root.0].children);
                let html = self.new_element("html", root);
                let body = self.new_element("body", html);
                self.reparent(content, body);
                return;
            }
        };

        if self.element_children(html).any(|c| self.tag(c) == Some("body")) {
            return;
        }
        let (head, rest): (Vec<NodeId>, Vec<NodeId>) = std::mem::take(&mut self.nodes[html.0].children)
            .into_iter()
            .partition(|c| self.tag(*c) == Some("head"));
        self.nodes[html.0].children = head;
        let body = self.new_element("body", html);
        self.reparent(rest, body);
    }

    fn compute_order(&mut self) {
        let mut order = vec![0; self.nodes.len()];
        let mut stack = vec![self.root()];
        let mut next = 0;
        while let Some(id) = stack.pop() {
            order[id.0] = next;
            next += 1;
            stack.extend(self.nodes[id.0].children.iter().rev().copied());
        }
        self.order = order;
    }
}

// ---------------------------------------------------------------------------
// Markup parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    doc: &'a mut Document,
    open: Vec<NodeId>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str, doc: &'a mut Document) -> Self {
        let root = doc.root();
        Self {
            src,
            pos: 0,
            doc,
            open: vec![root],
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn current(&self) -> NodeId {
        self.open.last().copied().unwrap_or(NodeId(0))
    }

    fn run(&mut self) {
        while self.pos < self.src.len() {
            let rest = self.rest();
            if rest.starts_with("<!--") {
                self.skip_past("-->");
            } else if rest.starts_with("<!") || rest.starts_with("<?") {
                self.skip_past(">");
            } else if rest.starts_with("</") {
                self.end_tag();
            } else if rest.starts_with('<')
                && rest[1..].chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            {
                self.start_tag();
            } else {
                self.text();
            }
        }
    }

    fn skip_past(&mut self, marker: &str) {
        match self.rest().find(marker) {
            Some(i) => self.pos += i + marker.len(),
            None => self.pos = self.src.len(),
        }
    }

    fn text(&mut self) {
        // A '<' that does not open a tag is literal text.
        let rest = self.rest();
        let first = rest.chars().next().map(char::len_utf8).unwrap_or(1);
        let end = rest[first..].find('<').map(|i| i + first).unwrap_or(rest.len());
        let raw = &rest[..end];
        self.pos += end;
        if !raw.trim().is_empty() {
            let parent = self.current();
            self.doc.push(NodeKind::Text(decode_entities(raw)), parent);
        }
    }

    fn read_name(&mut self) -> String {
        let rest = self.rest();
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/' || c == '=')
            .unwrap_or(rest.len());
        self.pos += end;
        rest[..end].to_ascii_lowercase()
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        let trimmed = rest.trim_start();
        self.pos += rest.len() - trimmed.len();
    }

    fn end_tag(&mut self) {
        self.pos += 2;
        let name = self.read_name();
        self.skip_past(">");
        if let Some(depth) = self
            .open
            .iter()
            .rposition(|id| self.doc.tag(*id) == Some(name.as_str()))
        {
            self.open.truncate(depth);
        }
    }

    fn start_tag(&mut self) {
        self.pos += 1;
        let tag = self.read_name();
        let mut attrs: Vec<(String, String)> = Vec::new();
        let mut self_closing = false;

        loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.is_empty() {
                break;
            }
            if rest.starts_with('>') {
                self.pos += 1;
                break;
            }
            if rest.starts_with("/>") {
                self.pos += 2;
                self_closing = true;
                break;
            }
            if rest.starts_with('/') {
                self.pos += 1;
                continue;
            }

            let name = self.read_name();
            if name.is_empty() {
                // Stray '=' or similar; skip one char so we always progress.
                self.pos += self.rest().chars().next().map(char::len_utf8).unwrap_or(1);
                continue;
            }
            self.skip_whitespace();
            let value = if self.rest().starts_with('=') {
                self.pos += 1;
                self.skip_whitespace();
                self.attr_value()
            } else {
                String::new()
            };
            if !attrs.iter().any(|(k, _)| *k == name) {
                attrs.push((name, value));
            }
        }

        let parent = self.current();
        let id = self.doc.push(
            NodeKind::Element(Element {
                tag: tag.clone(),
                attrs,
            }),
            parent,
        );

        if RAW_TEXT_ELEMENTS.contains(&tag.as_str()) {
            let closing = format!("</{}", tag);
            let lower = self.rest().to_ascii_lowercase();
            match lower.find(&closing) {
                Some(i) => {
                    self.pos += i;
                    self.skip_past(">");
                }
                None => self.pos = self.src.len(),
            }
            return;
        }

        if !self_closing && !VOID_ELEMENTS.contains(&tag.as_str()) {
            self.open.push(id);
        }
    }

    fn attr_value(&mut self) -> String {
        let rest = self.rest();
        let quote = match rest.chars().next() {
            Some(q @ ('"' | '\'')) => q,
            _ => {
                let end = rest
                    .find(|c: char| c.is_whitespace() || c == '>')
                    .unwrap_or(rest.len());
                self.pos += end;
                return decode_entities(&rest[..end]);
            }
        };
        let body = &rest[1..];
        match body.find(quote) {
            Some(end) => {
                self.pos += end + 2;
                decode_entities(&body[..end])
            }
            None => {
                self.pos = self.src.len();
                decode_entities(body)
            }
        }
    }
}

fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let decoded = after.find(';').filter(|end| *end <= 10).and_then(|end| {
            let entity = &after[..end];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ if entity.starts_with("#x") || entity.starts_with("#X") => {
                    u32::from_str_radix(&entity[2..], 16).ok().and_then(char::from_u32)
                }
                _ if entity.starts_with('#') => entity[1..].parse().ok().and_then(char::from_u32),
                _ => None,
            };
            ch.map(|c| (c, end))
        });
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &after[end + 1..];
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

// ---------------------------------------------------------------------------
// Locator expressions
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Expr {
    steps: Vec<Step>,
    group_index: Option<usize>,
}

#[derive(Debug)]
struct Step {
    descendant: bool,
    /// `None` is the `*` wildcard.
    name: Option<String>,
    predicates: Vec<Predicate>,
}

impl Step {
    fn name_matches(&self, tag: Option<&str>) -> bool {
        match (&self.name, tag) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(name), Some(tag)) => name == tag,
        }
    }
}

#[derive(Debug)]
enum Predicate {
    Position(usize),
    HasAttr(String),
    AttrEq(String, String),
    AttrContains(String, String),
    TextEq(String),
    TextContains(String),
}

/// Operand on the left of a comparison or inside `contains(...)`.
enum Operand {
    Attr(String),
    Text,
}

struct LocatorParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> LocatorParser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn error(&self) -> LocatorError {
        LocatorError::Unsupported {
            locator: self.src.to_string(),
            offset: self.pos,
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> Result<(), LocatorError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error())
        }
    }

    fn parse(mut self) -> Result<Expr, LocatorError> {
        let expr = if self.eat("(") {
            let steps = self.steps()?;
            self.expect(")")?;
            self.expect("[")?;
            let index = self.number()?;
            self.expect("]")?;
            Expr {
                steps,
                group_index: Some(index),
            }
        } else {
            Expr {
                steps: self.steps()?,
                group_index: None,
            }
        };
        self.skip_ws();
        if !self.rest().is_empty() {
            return Err(self.error());
        }
        Ok(expr)
    }

    fn steps(&mut self) -> Result<Vec<Step>, LocatorError> {
        let mut steps = Vec::new();
        loop {
            self.skip_ws();
            let descendant = if self.rest().starts_with("//") {
                self.pos += 2;
                true
            } else if self.rest().starts_with('/') {
                self.pos += 1;
                false
            } else {
                break;
            };
            let name = if self.eat("*") {
                None
            } else {
                let ident = self.ident();
                if ident.is_empty() {
                    return Err(self.error());
                }
                Some(ident.to_ascii_lowercase())
            };
            let mut predicates = Vec::new();
            while self.eat("[") {
                predicates.push(self.predicate()?);
                self.expect("]")?;
            }
            steps.push(Step {
                descendant,
                name,
                predicates,
            });
        }
        if steps.is_empty() {
            return Err(self.error());
        }
        Ok(steps)
    }

    fn ident(&mut self) -> &'a str {
        self.skip_ws();
        let rest = self.rest();
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':'))
            .unwrap_or(rest.len());
        self.pos += end;
        &rest[..end]
    }

    fn number(&mut self) -> Result<usize, LocatorError> {
        self.skip_ws();
        let rest = self.rest();
        let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let n = rest[..end].parse().map_err(|_| self.error())?;
        self.pos += end;
        Ok(n)
    }

    fn string(&mut self) -> Result<String, LocatorError> {
        self.skip_ws();
        let rest = self.rest();
        let quote = match rest.chars().next() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(self.error()),
        };
        let body = &rest[1..];
        let end = body.find(quote).ok_or_else(|| self.error())?;
        self.pos += end + 2;
        Ok(body[..end].to_string())
    }

    fn operand(&mut self) -> Result<Operand, LocatorError> {
        if self.eat("@") {
            let name = self.ident();
            if name.is_empty() {
                return Err(self.error());
            }
            Ok(Operand::Attr(name.to_ascii_lowercase()))
        } else if self.eat("text()") {
            Ok(Operand::Text)
        } else {
            Err(self.error())
        }
    }

    fn predicate(&mut self) -> Result<Predicate, LocatorError> {
        self.skip_ws();
        if self.rest().starts_with(|c: char| c.is_ascii_digit()) {
            let n = self.number()?;
            return Ok(Predicate::Position(n));
        }
        if self.eat("contains(") {
            let operand = self.operand()?;
            self.expect(",")?;
            let value = self.string()?;
            self.expect(")")?;
            return Ok(match operand {
                Operand::Attr(name) => Predicate::AttrContains(name, value),
                Operand::Text => Predicate::TextContains(value),
            });
        }
        let operand = self.operand()?;
        if self.eat("=") {
            let value = self.string()?;
            return Ok(match operand {
                Operand::Attr(name) => Predicate::AttrEq(name, value),
                Operand::Text => Predicate::TextEq(value),
            });
        }
        match operand {
            Operand::Attr(name) => Ok(Predicate::HasAttr(name)),
            Operand::Text => Err(self.error()),
        }
    }
}
