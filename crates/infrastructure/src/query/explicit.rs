//! Explicit query text.
//!
//! A small object query language over entity and property names:
//!
//! ```text
//! select m from Member m where m.username = :username and m.age = :age
//! select new MemberDto(m.id, m.username, t.name) from Member m join m.team t
//! select distinct m from Member m left join fetch m.team where m.age > ?1
//! select count(m) from Member m where m.age = :age
//! update Member m set m.age = m.age + 1 where m.age >= :age
//! delete from Member m where m.username in :names
//! ```
//!
//! Keywords are case-insensitive. A statement uses either named (`:name`) or
//! positional (`?1`) placeholders, never both.

use super::model::{AssignOp, JoinKind, JoinSpec, QueryModel, Selection};
use super::predicate::{Condition, Operator, ParamRef, Predicate};
use crate::{Error, Result};
use datajpa_common::{Order, Sort, SortDirection};
use datajpa_domain::Value;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Named(String),
    Positional(usize),
    Str(String),
    Int(i64),
    Symbol(&'static str),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{}", s),
            Token::Named(s) => write!(f, ":{}", s),
            Token::Positional(i) => write!(f, "?{}", i),
            Token::Str(s) => write!(f, "'{}'", s),
            Token::Int(i) => write!(f, "{}", i),
            Token::Symbol(s) => write!(f, "{}", s),
        }
    }
}

const SYMBOLS: &[&str] = &[
    "<>", "!=", "<=", ">=", "(", ")", ",", ".", "=", "<", ">", "+", "-", "*",
];

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse()
                .map_err(|_| Error::InvalidQuery(format!("integer literal {} out of range", text)))?;
            tokens.push(Token::Int(value));
            continue;
        }

        match c {
            ':' => {
                let start = i + 1;
                i = start;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                if i == start {
                    return Err(Error::InvalidQuery("':' without a parameter name".to_string()));
                }
                tokens.push(Token::Named(chars[start..i].iter().collect()));
            }
            '?' => {
                let start = i + 1;
                i = start;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let position: usize = chars[start..i]
                    .iter()
                    .collect::<String>()
                    .parse()
                    .map_err(|_| {
                        Error::InvalidQuery("positional parameters must be numbered (?1)".to_string())
                    })?;
                if position == 0 {
                    return Err(Error::InvalidQuery(
                        "positional parameters start at ?1".to_string(),
                    ));
                }
                tokens.push(Token::Positional(position));
            }
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(Error::InvalidQuery(
                                "unterminated string literal".to_string(),
                            ))
                        }
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            _ => {
                let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let symbol = SYMBOLS
                    .iter()
                    .find(|s| rest.starts_with(**s))
                    .ok_or_else(|| Error::InvalidQuery(format!("unexpected character '{}'", c)))?;
                tokens.push(Token::Symbol(symbol));
                i += symbol.len();
            }
        }
    }

    Ok(tokens)
}

/// Placeholder style used by a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    None,
    Named,
    Positional,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    style: PlaceholderStyle,
}

/// Parse explicit query text into a model.
pub fn parse(text: &str) -> Result<QueryModel> {
    let mut parser = Parser {
        tokens: tokenize(text)?,
        pos: 0,
        style: PlaceholderStyle::None,
    };

    let model = if parser.eat_keyword("select") {
        parser.select()?
    } else if parser.eat_keyword("update") {
        parser.update()?
    } else if parser.eat_keyword("delete") {
        parser.delete()?
    } else {
        return Err(Error::InvalidQuery(format!(
            "expected select, update or delete in '{}'",
            text
        )));
    };

    if let Some(token) = parser.peek() {
        return Err(Error::InvalidQuery(format!("unexpected '{}' in '{}'", token, text)));
    }
    Ok(model)
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.unexpected(keyword))
        }
    }

    fn eat_symbol(&mut self, symbol: &str) -> bool {
        if matches!(self.peek(), Some(Token::Symbol(s)) if *s == symbol) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, symbol: &str) -> Result<()> {
        if self.eat_symbol(symbol) {
            Ok(())
        } else {
            Err(self.unexpected(symbol))
        }
    }

    fn unexpected(&self, expected: &str) -> Error {
        match self.peek() {
            Some(token) => Error::InvalidQuery(format!("expected {}, found '{}'", expected, token)),
            None => Error::InvalidQuery(format!("expected {}, found end of query", expected)),
        }
    }

    fn is_reserved(word: &str) -> bool {
        const RESERVED: &[&str] = &[
            "select", "from", "where", "and", "or", "not", "join", "left", "inner", "outer",
            "fetch", "order", "by", "asc", "desc", "in", "is", "null", "like", "as", "set",
            "distinct", "new", "count", "update", "delete",
        ];
        RESERVED.iter().any(|r| word.eq_ignore_ascii_case(r))
    }

    fn identifier(&mut self) -> Result<String> {
        match self.peek() {
            Some(Token::Ident(s)) if !Self::is_reserved(s) => {
                let s = s.clone();
                self.pos += 1;
                Ok(s)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    /// `a.b.c`
    fn path(&mut self) -> Result<String> {
        let mut path = self.identifier()?;
        while self.eat_symbol(".") {
            path.push('.');
            path.push_str(&self.identifier()?);
        }
        Ok(path)
    }

    /// Optional `[as] alias`.
    fn alias(&mut self) -> Result<Option<String>> {
        if self.eat_keyword("as") {
            return self.identifier().map(Some);
        }
        match self.peek() {
            Some(Token::Ident(s)) if !Self::is_reserved(s) => self.identifier().map(Some),
            _ => Ok(None),
        }
    }

    fn entity(&mut self) -> Result<(String, Option<String>)> {
        let entity = self.identifier()?;
        let alias = self.alias()?;
        Ok((entity, alias))
    }

    fn select(&mut self) -> Result<QueryModel> {
        let distinct = self.eat_keyword("distinct");

        enum Head {
            Entity,
            Count(bool),
            Paths(Vec<String>),
            Constructor(String, Vec<String>),
        }

        let head = if self.eat_keyword("count") {
            self.expect_symbol("(")?;
            let count_distinct = self.eat_keyword("distinct");
            self.path()?;
            self.expect_symbol(")")?;
            Head::Count(count_distinct)
        } else if self.eat_keyword("new") {
            let name = self.path()?;
            self.expect_symbol("(")?;
            let paths = self.path_list()?;
            self.expect_symbol(")")?;
            Head::Constructor(name, paths)
        } else {
            Head::Paths(self.path_list()?)
        };

        self.expect_keyword("from")?;
        let (entity, alias) = self.entity()?;

        let head = match head {
            Head::Paths(paths) if paths.len() == 1 && Some(&paths[0]) == alias.as_ref() => {
                Head::Entity
            }
            other => other,
        };

        let mut model = match head {
            Head::Count(count_distinct) => {
                let mut model = QueryModel::count(&entity);
                model.distinct = count_distinct;
                model
            }
            Head::Entity => {
                let mut model = QueryModel::select(&entity);
                model.distinct = distinct;
                model
            }
            Head::Paths(paths) => {
                let mut model = QueryModel::select(&entity);
                model.distinct = distinct;
                model.selection = Selection::Paths(paths);
                model
            }
            Head::Constructor(name, paths) => {
                let mut model = QueryModel::select(&entity);
                model.distinct = distinct;
                model.selection = Selection::Constructor { name, paths };
                model
            }
        };
        model.alias = alias;

        self.joins(&mut model)?;
        model.filter = self.where_clause()?;

        if self.eat_keyword("order") {
            self.expect_keyword("by")?;
            model.sort = self.order_list()?;
        }

        Ok(model)
    }

    fn path_list(&mut self) -> Result<Vec<String>> {
        let mut paths = vec![self.path()?];
        while self.eat_symbol(",") {
            paths.push(self.path()?);
        }
        Ok(paths)
    }

    fn joins(&mut self, model: &mut QueryModel) -> Result<()> {
        loop {
            let kind = if self.eat_keyword("left") {
                self.eat_keyword("outer");
                JoinKind::Left
            } else if self.eat_keyword("inner") {
                JoinKind::Inner
            } else if self.peek_keyword("join") {
                JoinKind::Inner
            } else {
                return Ok(());
            };
            self.expect_keyword("join")?;
            let fetch = self.eat_keyword("fetch");
            let path = self.path()?;
            if !path.contains('.') {
                return Err(Error::InvalidQuery(format!(
                    "join path '{}' must start with an alias",
                    path
                )));
            }
            let alias = self.alias()?;
            model.joins.push(JoinSpec {
                path,
                alias,
                kind,
                fetch,
            });
        }
    }

    fn where_clause(&mut self) -> Result<Option<Predicate<String>>> {
        if self.eat_keyword("where") {
            Ok(Some(self.or_expr()?))
        } else {
            Ok(None)
        }
    }

    fn order_list(&mut self) -> Result<Sort> {
        let mut orders = Vec::new();
        loop {
            let path = self.path()?;
            let direction = if self.eat_keyword("desc") {
                SortDirection::Desc
            } else {
                self.eat_keyword("asc");
                SortDirection::Asc
            };
            orders.push(Order::new(path, direction));
            if !self.eat_symbol(",") {
                return Ok(Sort::from(orders));
            }
        }
    }

    fn or_expr(&mut self) -> Result<Predicate<String>> {
        let mut predicate = self.and_expr()?;
        while self.eat_keyword("or") {
            predicate = predicate.or(self.and_expr()?);
        }
        Ok(predicate)
    }

    fn and_expr(&mut self) -> Result<Predicate<String>> {
        let mut predicate = self.primary()?;
        while self.eat_keyword("and") {
            predicate = predicate.and(self.primary()?);
        }
        Ok(predicate)
    }

    fn primary(&mut self) -> Result<Predicate<String>> {
        if self.eat_symbol("(") {
            let inner = self.or_expr()?;
            self.expect_symbol(")")?;
            return Ok(inner);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Predicate<String>> {
        let path = self.path()?;

        let condition = |op: Operator, param: Option<ParamRef>| {
            Predicate::Condition(Condition {
                path: path.clone(),
                op,
                param,
            })
        };

        if self.eat_keyword("is") {
            let negated = self.eat_keyword("not");
            self.expect_keyword("null")?;
            let op = if negated {
                Operator::IsNotNull
            } else {
                Operator::IsNull
            };
            return Ok(condition(op, None));
        }

        let negated = self.eat_keyword("not");
        if self.eat_keyword("in") {
            let param = self.in_operand()?;
            let op = if negated { Operator::NotIn } else { Operator::In };
            return Ok(condition(op, Some(param)));
        }
        if self.eat_keyword("like") {
            let param = self.operand()?;
            let op = if negated {
                Operator::NotLike
            } else {
                Operator::Like
            };
            return Ok(condition(op, Some(param)));
        }
        if negated {
            return Err(self.unexpected("in or like after not"));
        }

        let op = match self.next() {
            Some(Token::Symbol("=")) => Operator::Equals,
            Some(Token::Symbol("<>")) | Some(Token::Symbol("!=")) => Operator::NotEquals,
            Some(Token::Symbol(">")) => Operator::GreaterThan,
            Some(Token::Symbol(">=")) => Operator::GreaterThanEqual,
            Some(Token::Symbol("<")) => Operator::LessThan,
            Some(Token::Symbol("<=")) => Operator::LessThanEqual,
            other => {
                return Err(Error::InvalidQuery(format!(
                    "expected comparison operator after '{}', found {}",
                    path,
                    other.map_or("end of query".to_string(), |t| format!("'{}'", t))
                )))
            }
        };

        let param = self.operand()?;
        Ok(condition(op, Some(param)))
    }

    fn placeholder(&mut self, style: PlaceholderStyle) -> Result<()> {
        match self.style {
            PlaceholderStyle::None => {
                self.style = style;
                Ok(())
            }
            current if current == style => Ok(()),
            _ => Err(Error::InvalidQuery(
                "named and positional parameters cannot be mixed".to_string(),
            )),
        }
    }

    fn operand(&mut self) -> Result<ParamRef> {
        match self.next() {
            Some(Token::Named(name)) => {
                self.placeholder(PlaceholderStyle::Named)?;
                Ok(ParamRef::Named(name))
            }
            Some(Token::Positional(position)) => {
                self.placeholder(PlaceholderStyle::Positional)?;
                Ok(ParamRef::Index(position - 1))
            }
            Some(_) => {
                self.pos -= 1;
                self.literal().map(ParamRef::Literal)
            }
            None => Err(self.unexpected("parameter or literal")),
        }
    }

    fn literal(&mut self) -> Result<Value> {
        let negative = self.eat_symbol("-");
        match self.next() {
            Some(Token::Int(v)) => Ok(Value::Int(if negative { -v } else { v })),
            Some(Token::Str(s)) if !negative => Ok(Value::Text(s)),
            Some(Token::Ident(s)) if !negative && s.eq_ignore_ascii_case("true") => {
                Ok(Value::Bool(true))
            }
            Some(Token::Ident(s)) if !negative && s.eq_ignore_ascii_case("false") => {
                Ok(Value::Bool(false))
            }
            Some(Token::Ident(s)) if !negative && s.eq_ignore_ascii_case("null") => Ok(Value::Null),
            _ => {
                self.pos -= 1;
                Err(self.unexpected("parameter or literal"))
            }
        }
    }

    /// `:names`, `?1`, `(:names)` or `('a', 'b')`.
    fn in_operand(&mut self) -> Result<ParamRef> {
        if !self.eat_symbol("(") {
            return self.operand();
        }

        let first = self.operand()?;
        if let ParamRef::Literal(value) = first {
            let mut items = vec![value];
            while self.eat_symbol(",") {
                items.push(self.literal()?);
            }
            self.expect_symbol(")")?;
            return Ok(ParamRef::Literal(Value::List(items)));
        }

        self.expect_symbol(")")?;
        Ok(first)
    }

    fn update(&mut self) -> Result<QueryModel> {
        let (entity, alias) = self.entity()?;
        let mut model = QueryModel::update(&entity);
        model.alias = alias;

        self.expect_keyword("set")?;
        loop {
            let path = self.path()?;
            self.expect_symbol("=")?;

            let (op, param) = if matches!(self.peek(), Some(Token::Ident(s)) if !Self::is_reserved(s) && !s.eq_ignore_ascii_case("true") && !s.eq_ignore_ascii_case("false"))
            {
                let source = self.path()?;
                if source != path {
                    return Err(Error::InvalidQuery(format!(
                        "'{}' can only be computed from itself, not '{}'",
                        path, source
                    )));
                }
                let op = if self.eat_symbol("+") {
                    AssignOp::Add
                } else if self.eat_symbol("-") {
                    AssignOp::Subtract
                } else {
                    return Err(self.unexpected("+ or -"));
                };
                (op, self.operand()?)
            } else {
                (AssignOp::Set, self.operand()?)
            };

            model = model.assign(&path, op, param);
            if !self.eat_symbol(",") {
                break;
            }
        }

        model.filter = self.where_clause()?;
        Ok(model)
    }

    fn delete(&mut self) -> Result<QueryModel> {
        self.eat_keyword("from");
        let (entity, alias) = self.entity()?;
        let mut model = QueryModel::delete(&entity);
        model.alias = alias;
        model.filter = self.where_clause()?;
        Ok(model)
    }
}

/// Whether `model` came from text whose kind is one of the bulk statements.
pub fn is_bulk_text(text: &str) -> bool {
    let head = text.trim_start();
    ["update", "delete"].iter().any(|kw| {
        head.len() >= kw.len() && head[..kw.len()].eq_ignore_ascii_case(kw)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::model::{Assignment, QueryKind};

    #[test]
    fn test_select_with_named_parameters() {
        let model =
            parse("select m from Member m where m.username = :username and m.age = :age").unwrap();

        assert_eq!(model.entity, "Member");
        assert_eq!(model.alias.as_deref(), Some("m"));
        assert_eq!(model.selection, Selection::Entity);
        assert_eq!(
            model.filter,
            Some(Predicate::And(vec![
                Predicate::named("m.username", Operator::Equals, "username"),
                Predicate::named("m.age", Operator::Equals, "age"),
            ]))
        );
    }

    #[test]
    fn test_constructor_projection_with_join() {
        let model = parse(
            "select new study.datajpa.dto.MemberDto(m.id, m.username, t.name) from Member m join m.team t",
        )
        .unwrap();

        assert_eq!(
            model.selection,
            Selection::Constructor {
                name: "study.datajpa.dto.MemberDto".to_string(),
                paths: vec!["m.id".into(), "m.username".into(), "t.name".into()],
            }
        );
        assert_eq!(model.joins.len(), 1);
        assert_eq!(model.joins[0].alias.as_deref(), Some("t"));
        assert_eq!(model.joins[0].kind, JoinKind::Inner);
    }

    #[test]
    fn test_fetch_join_and_order() {
        let model =
            parse("select distinct m from Member as m left join fetch m.team order by m.username desc, m.age")
                .unwrap();

        assert!(model.distinct);
        assert!(model.joins[0].fetch);
        assert_eq!(model.joins[0].kind, JoinKind::Left);
        assert_eq!(model.sort, Sort::desc("m.username").and(Sort::asc("m.age")));
    }

    #[test]
    fn test_count() {
        let model = parse("select count(m) from Member m where m.age = :age").unwrap();
        assert_eq!(model.kind, QueryKind::Count);
        assert!(!model.distinct);

        let model = parse("select count(distinct m) from Member m").unwrap();
        assert!(model.distinct);
    }

    #[test]
    fn test_in_forms() {
        let model = parse("select m from Member m where m.username in :names").unwrap();
        let model2 = parse("select m from Member m where m.username in (:names)").unwrap();
        assert_eq!(model.filter, model2.filter);

        let literal = parse("select m from Member m where m.username not in ('AAA', 'BBB')").unwrap();
        assert_eq!(
            literal.filter,
            Some(Predicate::condition(
                "m.username",
                Operator::NotIn,
                Some(ParamRef::Literal(Value::from(vec!["AAA", "BBB"])))
            ))
        );
    }

    #[test]
    fn test_positional_parameters() {
        let model = parse("select m from Member m where m.username = ?1 or (m.age > ?2 and m.team is null)")
            .unwrap();

        let mut refs = Vec::new();
        model.filter.unwrap().for_each_condition(&mut |c| refs.push(c.param.clone()));
        assert_eq!(
            refs,
            vec![Some(ParamRef::Index(0)), Some(ParamRef::Index(1)), None]
        );
    }

    #[test]
    fn test_update() {
        let model = parse("update Member m set m.age = m.age + 1 where m.age >= :age").unwrap();
        assert_eq!(
            model.kind,
            QueryKind::Update(vec![Assignment {
                path: "m.age".to_string(),
                op: AssignOp::Add,
                param: ParamRef::Literal(Value::from(1)),
            }])
        );
        assert!(model.filter.is_some());

        let model = parse("update Member m set m.username = 'x', m.age = :age").unwrap();
        match model.kind {
            QueryKind::Update(assignments) => assert_eq!(assignments.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_delete() {
        let model = parse("delete from Member m where m.age < 0").unwrap();
        assert_eq!(model.kind, QueryKind::Delete);
        assert!(is_bulk_text("  DELETE from Member m"));
        assert!(!is_bulk_text("select m from Member m"));
    }

    #[test]
    fn test_string_literal_escapes() {
        let model = parse("select m from Member m where m.username = 'O''Brien'").unwrap();
        assert_eq!(
            model.filter,
            Some(Predicate::eq("m.username", "O'Brien"))
        );
    }

    #[test]
    fn test_errors() {
        let invalid = [
            "",
            "select m",
            "select m from Member m where",
            "select m from Member m where m.username = :a and m.age = ?1",
            "select m from Member m where m.username = 'open",
            "select m from Member m where m.age = ?0",
            "update Member m set m.age = m.username + 1",
            "select m from Member m order",
            "select m from Member m where m.age # 3",
            "select m from Member m join team t",
        ];
        for text in invalid {
            assert!(
                matches!(parse(text), Err(Error::InvalidQuery(_))),
                "{} should be rejected",
                text
            );
        }
    }
}
