//! Recursive-descent parser with a Pratt-style precedence ladder.
//!
//! Input: the lexer's token vector. Output: the program as a `Vec<Stmt>`.
//! Parsing stops at the first violation with a [`ParseError`] carrying line
//! and column. Lex error tokens are surfaced here as parse errors.
//!
//! Notable disambiguations (see the statement/expression methods):
//! - `<` after an identifier opens generic arguments only when a speculative
//!   scan finds a matching `>` first.
//! - `(` in expression position becomes a tuple literal when a comma appears
//!   before the matching `)` or a `label:` prefix is present.
//! - `[ ... : ... ]` is a dictionary literal, `[:]` the empty dictionary.
//! - `{` in expression position begins a closure.
//! - `>>` is split into two `>` tokens when it closes two generic brackets.

use crate::{
    ast::{
        AccessLevel, AccessorBody, AttributeUse, BinaryOp, CallArg, CaseBinding, CastKind, ClassDecl, EnumCaseDecl,
        EnumDecl, Expr, ExtensionDecl, FuncDecl, FunctionTypeAnnotation, Param, Pattern, ProtocolDecl,
        ProtocolMethodReq, ProtocolPropertyReq, Stmt, StructDecl, SwitchCase, TypeAnnotation, UnaryOp, VarDecl,
        WhereClause,
    },
    error::ParseError,
    token::{Token, TokenKind},
    value::RefKind,
};

type ParseResult<T> = Result<T, ParseError>;

/// Parses a whole token stream into a program.
pub fn parse(tokens: Vec<Token>) -> ParseResult<Vec<Stmt>> {
    // The lexer stops at the first error token; surface it before parsing.
    if let Some(err) = tokens.iter().find(|t| t.kind == TokenKind::Error) {
        return Err(ParseError::new(err.lexeme.clone(), err.line, err.column));
    }
    Parser::new(tokens).parse_program()
}

/// Declaration modifiers accumulated before the introducing keyword.
#[derive(Debug, Default, Clone)]
struct Modifiers {
    access: AccessLevel,
    is_static: bool,
    is_override: bool,
    is_lazy: bool,
    is_mutating: bool,
    ref_kind: Option<RefKind>,
    attributes: Vec<AttributeUse>,
}

pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
}

impl Parser {
    #[must_use]
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, current: 0 }
    }

    pub fn parse_program(&mut self) -> ParseResult<Vec<Stmt>> {
        let mut statements = Vec::new();
        while !self.check(TokenKind::Eof) {
            statements.push(self.parse_statement()?);
        }
        Ok(statements)
    }

    // ---- Cursor helpers ----

    fn peek(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.current + offset).min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current.saturating_sub(1)]
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn check_at(&self, offset: usize, kind: TokenKind) -> bool {
        self.peek_at(offset).kind == kind
    }

    fn at_end(&self) -> bool {
        self.check(TokenKind::Eof)
    }

    fn advance(&mut self) -> &Token {
        if self.current < self.tokens.len() - 1 {
            self.current += 1;
        }
        self.previous()
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> ParseResult<Token> {
        if self.check(kind) {
            Ok(self.advance().clone())
        } else {
            Err(self.error_here(message))
        }
    }

    fn error_here(&self, message: &str) -> ParseError {
        let token = self.peek();
        ParseError::new(message, token.line, token.column)
    }

    fn line(&self) -> u32 {
        self.peek().line
    }

    // ---- Statements ----

    fn parse_statement(&mut self) -> ParseResult<Stmt> {
        while self.matches(TokenKind::Semicolon) {}

        // An attribute list is `[...]` directly followed by a declaration.
        let attributes = if self.check(TokenKind::LeftBracket) && self.attribute_list_ahead() {
            self.parse_attribute_list()?
        } else {
            Vec::new()
        };

        let mut modifiers = Modifiers {
            attributes,
            ..Modifiers::default()
        };
        self.parse_modifiers(&mut modifiers);

        match self.peek().kind {
            TokenKind::Var | TokenKind::Let => self.parse_var_statement(modifiers),
            TokenKind::Func => {
                let decl = self.parse_func_decl(modifiers)?;
                Ok(Stmt::Func(Box::new(decl)))
            }
            TokenKind::Class => self.parse_class_decl(modifiers),
            TokenKind::Struct => self.parse_struct_decl(modifiers),
            TokenKind::Enum => self.parse_enum_decl(modifiers),
            TokenKind::Protocol => self.parse_protocol_decl(modifiers),
            TokenKind::Extension => self.parse_extension_decl(),
            TokenKind::Attribute => self.parse_attribute_decl(),
            TokenKind::Import => self.parse_import(),
            TokenKind::If => self.parse_if(),
            TokenKind::Guard => self.parse_guard(),
            TokenKind::While => self.parse_while(),
            TokenKind::Repeat => self.parse_repeat(),
            TokenKind::For => self.parse_for(),
            TokenKind::Switch => self.parse_switch(),
            TokenKind::Break => {
                let line = self.line();
                self.advance();
                Ok(Stmt::Break { line })
            }
            TokenKind::Continue => {
                let line = self.line();
                self.advance();
                Ok(Stmt::Continue { line })
            }
            TokenKind::Return => self.parse_return(),
            TokenKind::Throw => {
                let line = self.line();
                self.advance();
                let value = self.parse_expression()?;
                Ok(Stmt::Throw { value, line })
            }
            TokenKind::Do => self.parse_do(),
            TokenKind::LeftBrace => {
                let line = self.line();
                let statements = self.parse_block()?;
                Ok(Stmt::Block { statements, line })
            }
            TokenKind::Identifier if self.peek().lexeme == "print" && self.check_at(1, TokenKind::LeftParen) => {
                let line = self.line();
                self.advance(); // print
                self.advance(); // (
                let expr = self.parse_expression()?;
                self.consume(TokenKind::RightParen, "Expected ')' after print argument")?;
                Ok(Stmt::Print { expr, line })
            }
            _ => {
                let line = self.line();
                let expr = self.parse_expression()?;
                self.matches(TokenKind::Semicolon);
                Ok(Stmt::Expression { expr, line })
            }
        }
    }

    fn parse_modifiers(&mut self, modifiers: &mut Modifiers) {
        loop {
            match self.peek().kind {
                TokenKind::Public => {
                    modifiers.access = AccessLevel::Public;
                    self.advance();
                }
                TokenKind::Private => {
                    modifiers.access = AccessLevel::Private;
                    self.advance();
                }
                TokenKind::Internal => {
                    modifiers.access = AccessLevel::Internal;
                    self.advance();
                }
                TokenKind::Fileprivate => {
                    modifiers.access = AccessLevel::Fileprivate;
                    self.advance();
                }
                TokenKind::Static => {
                    modifiers.is_static = true;
                    self.advance();
                }
                TokenKind::Override => {
                    modifiers.is_override = true;
                    self.advance();
                }
                TokenKind::Lazy => {
                    modifiers.is_lazy = true;
                    self.advance();
                }
                TokenKind::Mutating => {
                    modifiers.is_mutating = true;
                    self.advance();
                }
                TokenKind::Weak => {
                    modifiers.ref_kind = Some(RefKind::Weak);
                    self.advance();
                }
                TokenKind::Unowned => {
                    modifiers.ref_kind = Some(RefKind::Unowned);
                    self.advance();
                }
                _ => return,
            }
        }
    }

    /// Whether the `[` at the cursor starts an attribute list rather than an
    /// array literal: the matching `]` must be followed by a declaration
    /// keyword.
    fn attribute_list_ahead(&self) -> bool {
        let mut depth = 0usize;
        let mut i = self.current;
        while i < self.tokens.len() {
            match self.tokens[i].kind {
                TokenKind::LeftBracket => depth += 1,
                TokenKind::RightBracket => {
                    depth -= 1;
                    if depth == 0 {
                        return matches!(
                            self.tokens.get(i + 1).map(|t| t.kind),
                            Some(
                                TokenKind::Func
                                    | TokenKind::Class
                                    | TokenKind::Struct
                                    | TokenKind::Enum
                                    | TokenKind::Protocol
                                    | TokenKind::Var
                                    | TokenKind::Let
                                    | TokenKind::Public
                                    | TokenKind::Private
                                    | TokenKind::Internal
                                    | TokenKind::Fileprivate
                                    | TokenKind::Static
                                    | TokenKind::Override
                                    | TokenKind::Mutating
                                    | TokenKind::Lazy
                                    | TokenKind::Init
                            )
                        );
                    }
                }
                TokenKind::Eof => return false,
                _ => {}
            }
            i += 1;
        }
        false
    }

    fn parse_attribute_list(&mut self) -> ParseResult<Vec<AttributeUse>> {
        self.consume(TokenKind::LeftBracket, "Expected '['")?;
        let mut attributes = Vec::new();
        loop {
            let name = self.consume(TokenKind::Identifier, "Expected attribute name")?;
            let line = name.line;
            let mut args = Vec::new();
            if self.matches(TokenKind::LeftParen) {
                if !self.check(TokenKind::RightParen) {
                    loop {
                        args.push(self.parse_expression()?);
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(TokenKind::RightParen, "Expected ')' after attribute arguments")?;
            }
            attributes.push(AttributeUse {
                name: name.lexeme,
                args,
                line,
            });
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightBracket, "Expected ']' after attribute list")?;
        Ok(attributes)
    }

    fn parse_var_statement(&mut self, modifiers: Modifiers) -> ParseResult<Stmt> {
        let is_let = self.peek().kind == TokenKind::Let;
        let line = self.line();
        self.advance(); // var / let

        // Tuple destructuring: `let (a, b) = expr`.
        if self.check(TokenKind::LeftParen) {
            self.advance();
            let mut names = Vec::new();
            loop {
                let name = self.consume(TokenKind::Identifier, "Expected binding name in tuple destructuring")?;
                names.push(name.lexeme);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.consume(TokenKind::RightParen, "Expected ')' in tuple destructuring")?;
            self.consume(TokenKind::Equal, "Expected '=' in tuple destructuring")?;
            let value = self.parse_expression()?;
            return Ok(Stmt::TupleDestructure {
                names,
                is_let,
                value,
                line,
            });
        }

        let decl = self.parse_var_decl_body(is_let, line, modifiers)?;
        Ok(Stmt::Var(Box::new(decl)))
    }

    fn parse_var_decl_body(&mut self, is_let: bool, line: u32, modifiers: Modifiers) -> ParseResult<VarDecl> {
        let name = self.consume(TokenKind::Identifier, "Expected variable name")?;

        let type_annotation = if self.matches(TokenKind::Colon) {
            Some(self.parse_type_annotation()?)
        } else {
            None
        };

        let mut initializer = None;
        let mut getter = None;
        let mut setter = None;
        let mut will_set = None;
        let mut did_set = None;

        if self.matches(TokenKind::Equal) {
            initializer = Some(self.parse_expression()?);
        }

        // Accessor block: computed `get`/`set`, observers, or a shorthand
        // getter body. A brace after an initializer is only an accessor
        // block when it opens with an observer/accessor keyword; otherwise
        // it belongs to the next statement.
        let accessor_ahead = self.check(TokenKind::LeftBrace)
            && (initializer.is_none()
                || matches!(
                    self.peek_at(1).kind,
                    TokenKind::Get | TokenKind::Set | TokenKind::WillSet | TokenKind::DidSet
                ));
        if accessor_ahead {
            self.advance(); // {
            match self.peek().kind {
                TokenKind::Get => {
                    self.advance();
                    getter = Some(self.parse_block()?);
                    if self.matches(TokenKind::Set) {
                        let param = self.parse_accessor_param()?;
                        let body = self.parse_block()?;
                        setter = Some(AccessorBody { param, body });
                    }
                }
                TokenKind::WillSet | TokenKind::DidSet => {
                    while self.check(TokenKind::WillSet) || self.check(TokenKind::DidSet) {
                        let is_will = self.peek().kind == TokenKind::WillSet;
                        self.advance();
                        let param = self.parse_accessor_param()?;
                        let body = self.parse_block()?;
                        let accessor = AccessorBody { param, body };
                        if is_will {
                            will_set = Some(accessor);
                        } else {
                            did_set = Some(accessor);
                        }
                    }
                }
                _ => {
                    // Shorthand getter: the brace body is the getter.
                    let mut statements = Vec::new();
                    while !self.check(TokenKind::RightBrace) && !self.at_end() {
                        statements.push(self.parse_statement()?);
                    }
                    getter = Some(statements);
                }
            }
            self.consume(TokenKind::RightBrace, "Expected '}' after accessor block")?;
        }

        Ok(VarDecl {
            name: name.lexeme,
            is_let,
            is_static: modifiers.is_static,
            is_lazy: modifiers.is_lazy,
            ref_kind: modifiers.ref_kind.unwrap_or(RefKind::Strong),
            access: modifiers.access,
            type_annotation,
            initializer,
            getter,
            setter,
            will_set,
            did_set,
            attributes: modifiers.attributes,
            line,
        })
    }

    fn parse_accessor_param(&mut self) -> ParseResult<Option<String>> {
        if self.matches(TokenKind::LeftParen) {
            let name = self.consume(TokenKind::Identifier, "Expected accessor parameter name")?;
            self.consume(TokenKind::RightParen, "Expected ')' after accessor parameter")?;
            Ok(Some(name.lexeme))
        } else {
            Ok(None)
        }
    }

    fn parse_func_decl(&mut self, modifiers: Modifiers) -> ParseResult<FuncDecl> {
        let line = self.line();
        self.consume(TokenKind::Func, "Expected 'func'")?;

        // Function name: identifier, soft keyword, or operator symbol.
        let name = if self.check(TokenKind::Identifier) || self.peek().kind.is_soft_keyword() {
            self.advance().lexeme.clone()
        } else if self.peek().kind.is_operator_name() {
            self.advance().lexeme.clone()
        } else {
            return Err(self.error_here("Expected function name"));
        };

        let generic_params = self.parse_generic_params()?;
        let params = self.parse_param_list()?;

        let throws = self.matches(TokenKind::Throws);

        let return_type = if self.matches(TokenKind::Arrow) {
            Some(self.parse_type_annotation()?)
        } else {
            None
        };

        let where_clauses = self.parse_where_clauses()?;
        let body = self.parse_block()?;

        Ok(FuncDecl {
            name,
            params,
            return_type,
            body,
            is_static: modifiers.is_static,
            is_mutating: modifiers.is_mutating,
            is_override: modifiers.is_override,
            throws,
            access: modifiers.access,
            generic_params,
            where_clauses,
            attributes: modifiers.attributes,
            line,
        })
    }

    fn parse_generic_params(&mut self) -> ParseResult<Vec<String>> {
        let mut params = Vec::new();
        if self.matches(TokenKind::Less) {
            loop {
                let name = self.consume(TokenKind::Identifier, "Expected generic parameter name")?;
                params.push(name.lexeme);
                // Inline bound `T: Proto` is recorded as a where clause by
                // the caller via parse_where_clauses; here we skip it.
                if self.matches(TokenKind::Colon) {
                    self.consume(TokenKind::Identifier, "Expected constraint name")?;
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.expect_generic_close()?;
        }
        Ok(params)
    }

    fn parse_where_clauses(&mut self) -> ParseResult<Vec<WhereClause>> {
        let mut clauses = Vec::new();
        if self.matches(TokenKind::Where) {
            loop {
                let param = self.consume(TokenKind::Identifier, "Expected type parameter in where clause")?;
                let line = param.line;
                self.consume(TokenKind::Colon, "Expected ':' in where clause")?;
                let constraint = self.consume(TokenKind::Identifier, "Expected constraint in where clause")?;
                clauses.push(WhereClause {
                    param: param.lexeme,
                    constraint: constraint.lexeme,
                    line,
                });
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        Ok(clauses)
    }

    fn parse_param_list(&mut self) -> ParseResult<Vec<Param>> {
        self.consume(TokenKind::LeftParen, "Expected '(' before parameters")?;
        let mut params = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                params.push(self.parse_param()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after parameters")?;
        Ok(params)
    }

    fn parse_param(&mut self) -> ParseResult<Param> {
        // `_ name`, `label name`, or just `name`.
        let mut label = None;
        let mut label_omitted = false;
        let first = self.consume(TokenKind::Identifier, "Expected parameter name")?;
        let name = if self.check(TokenKind::Identifier) {
            if first.lexeme == "_" {
                label_omitted = true;
            } else {
                label = Some(first.lexeme.clone());
            }
            self.advance().lexeme.clone()
        } else if first.lexeme == "_" {
            return Err(self.error_here("Expected parameter name after '_'"));
        } else {
            first.lexeme.clone()
        };

        let type_annotation = if self.matches(TokenKind::Colon) {
            Some(self.parse_type_annotation()?)
        } else {
            None
        };

        let default_value = if self.matches(TokenKind::Equal) {
            Some(self.parse_expression()?)
        } else {
            None
        };

        Ok(Param {
            label,
            name,
            type_annotation,
            default_value,
            label_omitted,
        })
    }

    // ---- Type declarations ----

    fn parse_inheritance_list(&mut self) -> ParseResult<Vec<String>> {
        let mut names = Vec::new();
        if self.matches(TokenKind::Colon) {
            loop {
                let name = self.consume(TokenKind::Identifier, "Expected type name in inheritance list")?;
                names.push(name.lexeme);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        Ok(names)
    }

    fn parse_class_decl(&mut self, modifiers: Modifiers) -> ParseResult<Stmt> {
        let line = self.line();
        self.consume(TokenKind::Class, "Expected 'class'")?;
        let name = self.consume(TokenKind::Identifier, "Expected class name")?;
        let generic_params = self.parse_generic_params()?;
        let inheritance = self.parse_inheritance_list()?;
        let where_clauses = self.parse_where_clauses()?;
        self.consume(TokenKind::LeftBrace, "Expected '{' before class body")?;

        let mut decl = ClassDecl {
            name: name.lexeme,
            inheritance,
            properties: Vec::new(),
            methods: Vec::new(),
            initializers: Vec::new(),
            deinitializer: None,
            access: modifiers.access,
            generic_params,
            where_clauses,
            attributes: modifiers.attributes,
            line,
        };

        while !self.check(TokenKind::RightBrace) && !self.at_end() {
            self.parse_type_member(
                &mut decl.properties,
                &mut decl.methods,
                &mut decl.initializers,
                Some(&mut decl.deinitializer),
            )?;
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after class body")?;
        Ok(Stmt::Class(Box::new(decl)))
    }

    fn parse_struct_decl(&mut self, modifiers: Modifiers) -> ParseResult<Stmt> {
        let line = self.line();
        self.consume(TokenKind::Struct, "Expected 'struct'")?;
        let name = self.consume(TokenKind::Identifier, "Expected struct name")?;
        let generic_params = self.parse_generic_params()?;
        let inheritance = self.parse_inheritance_list()?;
        let where_clauses = self.parse_where_clauses()?;
        self.consume(TokenKind::LeftBrace, "Expected '{' before struct body")?;

        let mut decl = StructDecl {
            name: name.lexeme,
            inheritance,
            properties: Vec::new(),
            methods: Vec::new(),
            initializers: Vec::new(),
            access: modifiers.access,
            generic_params,
            where_clauses,
            attributes: modifiers.attributes,
            line,
        };

        while !self.check(TokenKind::RightBrace) && !self.at_end() {
            self.parse_type_member(&mut decl.properties, &mut decl.methods, &mut decl.initializers, None)?;
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after struct body")?;
        Ok(Stmt::Struct(Box::new(decl)))
    }

    /// Parses one member of a class/struct/extension body into the matching
    /// output list.
    fn parse_type_member(
        &mut self,
        properties: &mut Vec<VarDecl>,
        methods: &mut Vec<FuncDecl>,
        initializers: &mut Vec<FuncDecl>,
        deinitializer: Option<&mut Option<Vec<Stmt>>>,
    ) -> ParseResult<()> {
        while self.matches(TokenKind::Semicolon) {}

        let attributes = if self.check(TokenKind::LeftBracket) && self.attribute_list_ahead() {
            self.parse_attribute_list()?
        } else {
            Vec::new()
        };
        let mut modifiers = Modifiers {
            attributes,
            ..Modifiers::default()
        };
        self.parse_modifiers(&mut modifiers);

        match self.peek().kind {
            TokenKind::Var | TokenKind::Let => {
                let is_let = self.peek().kind == TokenKind::Let;
                let line = self.line();
                self.advance();
                let decl = self.parse_var_decl_body(is_let, line, modifiers)?;
                properties.push(decl);
            }
            TokenKind::Func => {
                let decl = self.parse_func_decl(modifiers)?;
                methods.push(decl);
            }
            TokenKind::Init => {
                let line = self.line();
                self.advance();
                let params = self.parse_param_list()?;
                let throws = self.matches(TokenKind::Throws);
                let body = self.parse_block()?;
                initializers.push(FuncDecl {
                    name: "init".to_owned(),
                    params,
                    return_type: None,
                    body,
                    is_static: false,
                    is_mutating: true,
                    is_override: modifiers.is_override,
                    throws,
                    access: modifiers.access,
                    generic_params: Vec::new(),
                    where_clauses: Vec::new(),
                    attributes: modifiers.attributes,
                    line,
                });
            }
            TokenKind::Deinit => {
                self.advance();
                let body = self.parse_block()?;
                match deinitializer {
                    Some(slot) => *slot = Some(body),
                    None => return Err(self.error_here("'deinit' is only allowed in classes")),
                }
            }
            _ => return Err(self.error_here("Expected member declaration")),
        }
        Ok(())
    }

    fn parse_enum_decl(&mut self, modifiers: Modifiers) -> ParseResult<Stmt> {
        let line = self.line();
        self.consume(TokenKind::Enum, "Expected 'enum'")?;
        let name = self.consume(TokenKind::Identifier, "Expected enum name")?;
        let inheritance = self.parse_inheritance_list()?;
        self.consume(TokenKind::LeftBrace, "Expected '{' before enum body")?;

        let mut decl = EnumDecl {
            name: name.lexeme,
            inheritance,
            cases: Vec::new(),
            properties: Vec::new(),
            methods: Vec::new(),
            access: modifiers.access,
            attributes: modifiers.attributes,
            line,
        };

        while !self.check(TokenKind::RightBrace) && !self.at_end() {
            while self.matches(TokenKind::Semicolon) {}
            let mut member_modifiers = Modifiers::default();
            self.parse_modifiers(&mut member_modifiers);
            match self.peek().kind {
                TokenKind::Case => {
                    self.advance();
                    loop {
                        let case = self.parse_enum_case()?;
                        decl.cases.push(case);
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                TokenKind::Func => {
                    let func = self.parse_func_decl(member_modifiers)?;
                    decl.methods.push(func);
                }
                TokenKind::Var | TokenKind::Let => {
                    let is_let = self.peek().kind == TokenKind::Let;
                    let member_line = self.line();
                    self.advance();
                    let property = self.parse_var_decl_body(is_let, member_line, member_modifiers)?;
                    decl.properties.push(property);
                }
                _ => return Err(self.error_here("Expected 'case', method, or property in enum body")),
            }
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after enum body")?;
        Ok(Stmt::Enum(Box::new(decl)))
    }

    fn parse_enum_case(&mut self) -> ParseResult<EnumCaseDecl> {
        let name = self.consume(TokenKind::Identifier, "Expected case name")?;
        let line = name.line;
        let mut assoc = Vec::new();
        let mut raw_value = None;

        if self.matches(TokenKind::LeftParen) {
            if !self.check(TokenKind::RightParen) {
                loop {
                    // `label: Type` or `_ Type` or bare `Type`.
                    let mut label = None;
                    if self.check(TokenKind::Identifier) && self.check_at(1, TokenKind::Colon) {
                        let label_token = self.advance().lexeme.clone();
                        label = if label_token == "_" { None } else { Some(label_token) };
                        self.advance(); // :
                    }
                    let annotation = self.parse_type_annotation()?;
                    assoc.push((label, Some(annotation)));
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.consume(TokenKind::RightParen, "Expected ')' after associated values")?;
        } else if self.matches(TokenKind::Equal) {
            raw_value = Some(self.parse_expression()?);
        }

        Ok(EnumCaseDecl {
            name: name.lexeme,
            raw_value,
            assoc,
            line,
        })
    }

    fn parse_protocol_decl(&mut self, modifiers: Modifiers) -> ParseResult<Stmt> {
        let line = self.line();
        self.consume(TokenKind::Protocol, "Expected 'protocol'")?;
        let name = self.consume(TokenKind::Identifier, "Expected protocol name")?;
        let inherited = self.parse_inheritance_list()?;
        self.consume(TokenKind::LeftBrace, "Expected '{' before protocol body")?;

        let mut decl = ProtocolDecl {
            name: name.lexeme,
            inherited,
            methods: Vec::new(),
            properties: Vec::new(),
            access: modifiers.access,
            line,
        };

        while !self.check(TokenKind::RightBrace) && !self.at_end() {
            while self.matches(TokenKind::Semicolon) {}
            let mut member_modifiers = Modifiers::default();
            self.parse_modifiers(&mut member_modifiers);
            match self.peek().kind {
                TokenKind::Func => {
                    let member_line = self.line();
                    self.advance();
                    let method_name = if self.check(TokenKind::Identifier) {
                        self.advance().lexeme.clone()
                    } else if self.peek().kind.is_operator_name() {
                        self.advance().lexeme.clone()
                    } else {
                        return Err(self.error_here("Expected method name"));
                    };
                    let params = self.parse_param_list()?;
                    let return_type = if self.matches(TokenKind::Arrow) {
                        Some(self.parse_type_annotation()?)
                    } else {
                        None
                    };
                    decl.methods.push(ProtocolMethodReq {
                        name: method_name,
                        params,
                        return_type,
                        is_static: member_modifiers.is_static,
                        is_mutating: member_modifiers.is_mutating,
                        line: member_line,
                    });
                }
                TokenKind::Var => {
                    let member_line = self.line();
                    self.advance();
                    let property_name = self.consume(TokenKind::Identifier, "Expected property name")?;
                    self.consume(TokenKind::Colon, "Expected ':' in property requirement")?;
                    let annotation = self.parse_type_annotation()?;
                    self.consume(TokenKind::LeftBrace, "Expected '{ get }' or '{ get set }'")?;
                    let mut has_getter = false;
                    let mut has_setter = false;
                    loop {
                        if self.matches(TokenKind::Get) {
                            has_getter = true;
                        } else if self.matches(TokenKind::Set) {
                            has_setter = true;
                        } else {
                            break;
                        }
                    }
                    self.consume(TokenKind::RightBrace, "Expected '}' after accessor requirements")?;
                    decl.properties.push(ProtocolPropertyReq {
                        name: property_name.lexeme,
                        type_annotation: Some(annotation),
                        has_getter,
                        has_setter,
                        is_static: member_modifiers.is_static,
                        line: member_line,
                    });
                }
                _ => return Err(self.error_here("Expected method or property requirement in protocol body")),
            }
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after protocol body")?;
        Ok(Stmt::Protocol(Box::new(decl)))
    }

    fn parse_extension_decl(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.consume(TokenKind::Extension, "Expected 'extension'")?;
        let name = self.consume(TokenKind::Identifier, "Expected extended type name")?;
        let conformances = self.parse_inheritance_list()?;
        self.consume(TokenKind::LeftBrace, "Expected '{' before extension body")?;

        let mut decl = ExtensionDecl {
            extended_type: name.lexeme,
            conformances,
            properties: Vec::new(),
            methods: Vec::new(),
            initializers: Vec::new(),
            line,
        };

        while !self.check(TokenKind::RightBrace) && !self.at_end() {
            self.parse_type_member(&mut decl.properties, &mut decl.methods, &mut decl.initializers, None)?;
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after extension body")?;
        Ok(Stmt::Extension(Box::new(decl)))
    }

    fn parse_attribute_decl(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.consume(TokenKind::Attribute, "Expected 'attribute'")?;
        let name = self.consume(TokenKind::Identifier, "Expected attribute name")?;
        let mut params = Vec::new();
        if self.matches(TokenKind::LeftParen) {
            if !self.check(TokenKind::RightParen) {
                loop {
                    let param = self.consume(TokenKind::Identifier, "Expected attribute parameter name")?;
                    params.push(param.lexeme);
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.consume(TokenKind::RightParen, "Expected ')' after attribute parameters")?;
        }
        Ok(Stmt::AttributeDecl {
            name: name.lexeme,
            params,
            line,
        })
    }

    fn parse_import(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.consume(TokenKind::Import, "Expected 'import'")?;
        let path = self.consume(TokenKind::String, "Expected module path string after 'import'")?;
        Ok(Stmt::Import {
            path: decode_string_literal(&path.lexeme),
            line,
        })
    }

    // ---- Control flow statements ----

    fn parse_block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.consume(TokenKind::LeftBrace, "Expected '{'")?;
        let mut statements = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.at_end() {
            statements.push(self.parse_statement()?);
        }
        self.consume(TokenKind::RightBrace, "Expected '}'")?;
        Ok(statements)
    }

    fn parse_if(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.consume(TokenKind::If, "Expected 'if'")?;

        if self.matches(TokenKind::Let) {
            let name = self.consume(TokenKind::Identifier, "Expected binding name after 'if let'")?;
            self.consume(TokenKind::Equal, "Expected '=' after 'if let' binding")?;
            let value = self.parse_expression()?;
            let then_branch = self.parse_block()?;
            let else_branch = self.parse_else_branch()?;
            return Ok(Stmt::IfLet {
                name: name.lexeme,
                value,
                then_branch,
                else_branch,
                line,
            });
        }

        let condition = self.parse_expression()?;
        let then_branch = self.parse_block()?;
        let else_branch = self.parse_else_branch()?;
        Ok(Stmt::If {
            condition,
            then_branch,
            else_branch,
            line,
        })
    }

    fn parse_else_branch(&mut self) -> ParseResult<Option<Vec<Stmt>>> {
        if self.matches(TokenKind::Else) {
            if self.check(TokenKind::If) {
                let nested = self.parse_if()?;
                Ok(Some(vec![nested]))
            } else {
                Ok(Some(self.parse_block()?))
            }
        } else {
            Ok(None)
        }
    }

    fn parse_guard(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.consume(TokenKind::Guard, "Expected 'guard'")?;
        self.consume(TokenKind::Let, "Expected 'let' after 'guard'")?;
        let name = self.consume(TokenKind::Identifier, "Expected binding name after 'guard let'")?;
        self.consume(TokenKind::Equal, "Expected '=' after 'guard let' binding")?;
        let value = self.parse_expression()?;
        self.consume(TokenKind::Else, "Expected 'else' in guard statement")?;
        let else_branch = self.parse_block()?;
        Ok(Stmt::GuardLet {
            name: name.lexeme,
            value,
            else_branch,
            line,
        })
    }

    fn parse_while(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.consume(TokenKind::While, "Expected 'while'")?;
        let condition = self.parse_expression()?;
        let body = self.parse_block()?;
        Ok(Stmt::While { condition, body, line })
    }

    fn parse_repeat(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.consume(TokenKind::Repeat, "Expected 'repeat'")?;
        let body = self.parse_block()?;
        self.consume(TokenKind::While, "Expected 'while' after repeat body")?;
        let condition = self.parse_expression()?;
        Ok(Stmt::RepeatWhile { body, condition, line })
    }

    fn parse_for(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.consume(TokenKind::For, "Expected 'for'")?;
        let variable = self.consume(TokenKind::Identifier, "Expected loop variable")?;
        self.consume(TokenKind::In, "Expected 'in' after loop variable")?;
        let iterable = self.parse_expression()?;
        let where_clause = if self.matches(TokenKind::Where) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        let body = self.parse_block()?;
        Ok(Stmt::ForIn {
            variable: variable.lexeme,
            iterable,
            where_clause,
            body,
            line,
        })
    }

    fn parse_switch(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.consume(TokenKind::Switch, "Expected 'switch'")?;
        let value = self.parse_expression()?;
        self.consume(TokenKind::LeftBrace, "Expected '{' after switch value")?;

        let mut cases = Vec::new();
        let mut default = None;

        while !self.check(TokenKind::RightBrace) && !self.at_end() {
            if self.matches(TokenKind::Case) {
                let case_line = self.previous().line;
                let mut patterns = Vec::new();
                loop {
                    patterns.push(self.parse_case_pattern()?);
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
                self.consume(TokenKind::Colon, "Expected ':' after case patterns")?;
                let body = self.parse_case_body()?;
                cases.push(SwitchCase {
                    patterns,
                    body,
                    line: case_line,
                });
            } else if self.matches(TokenKind::Default) {
                self.consume(TokenKind::Colon, "Expected ':' after 'default'")?;
                default = Some(self.parse_case_body()?);
            } else {
                return Err(self.error_here("Expected 'case' or 'default' in switch body"));
            }
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after switch body")?;
        Ok(Stmt::Switch {
            value,
            cases,
            default,
            line,
        })
    }

    fn parse_case_pattern(&mut self) -> ParseResult<Pattern> {
        let line = self.line();
        if self.check(TokenKind::Dot) && self.check_at(1, TokenKind::Identifier) {
            self.advance(); // .
            let name = self.advance().lexeme.clone();
            let mut bindings = Vec::new();
            if self.matches(TokenKind::LeftParen) {
                if !self.check(TokenKind::RightParen) {
                    loop {
                        if self.matches(TokenKind::Let) {
                            let binding = self.consume(TokenKind::Identifier, "Expected binding name after 'let'")?;
                            bindings.push(CaseBinding {
                                name: Some(binding.lexeme),
                            });
                        } else if self.check(TokenKind::Identifier) && self.peek().lexeme == "_" {
                            self.advance();
                            bindings.push(CaseBinding { name: None });
                        } else {
                            return Err(self.error_here("Expected 'let' binding or '_' in case pattern"));
                        }
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(TokenKind::RightParen, "Expected ')' after case bindings")?;
            }
            return Ok(Pattern::EnumCase { name, bindings, line });
        }

        let expr = self.parse_expression()?;
        Ok(Pattern::Expression { expr, line })
    }

    fn parse_case_body(&mut self) -> ParseResult<Vec<Stmt>> {
        let mut statements = Vec::new();
        while !self.check(TokenKind::Case)
            && !self.check(TokenKind::Default)
            && !self.check(TokenKind::RightBrace)
            && !self.at_end()
        {
            statements.push(self.parse_statement()?);
        }
        Ok(statements)
    }

    fn parse_return(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.consume(TokenKind::Return, "Expected 'return'")?;
        let value = if self.check(TokenKind::RightBrace)
            || self.check(TokenKind::Case)
            || self.check(TokenKind::Default)
            || self.at_end()
        {
            None
        } else {
            Some(self.parse_expression()?)
        };
        Ok(Stmt::Return { value, line })
    }

    /// `do`/`catch` parses but executes only the `do` body; `catch` blocks
    /// are reserved syntax until error handling lands in the VM.
    fn parse_do(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.consume(TokenKind::Do, "Expected 'do'")?;
        let statements = self.parse_block()?;
        while self.matches(TokenKind::Catch) {
            if self.check(TokenKind::Identifier) {
                self.advance();
            }
            let _ = self.parse_block()?;
        }
        Ok(Stmt::Block { statements, line })
    }

    // ---- Expressions ----

    pub fn parse_expression(&mut self) -> ParseResult<Expr> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> ParseResult<Expr> {
        let expr = self.parse_ternary()?;

        if self.check(TokenKind::Equal) {
            let line = self.line();
            self.advance();
            let value = self.parse_assignment()?;
            self.check_assignable(&expr)?;
            return Ok(Expr::Assign {
                target: Box::new(expr),
                value: Box::new(value),
                line,
            });
        }

        if self.peek().kind.is_compound_assign() {
            let line = self.line();
            let op = compound_op(self.peek().kind);
            self.advance();
            let value = self.parse_assignment()?;
            self.check_assignable(&expr)?;
            return Ok(Expr::CompoundAssign {
                op,
                target: Box::new(expr),
                value: Box::new(value),
                line,
            });
        }

        Ok(expr)
    }

    fn check_assignable(&self, target: &Expr) -> ParseResult<()> {
        match target {
            Expr::Identifier { .. }
            | Expr::Member { .. }
            | Expr::OptionalMember { .. }
            | Expr::Subscript { .. }
            | Expr::TupleIndex { .. }
            | Expr::SelfExpr { .. } => Ok(()),
            other => Err(ParseError::new("Invalid assignment target", other.line(), 0)),
        }
    }

    fn parse_ternary(&mut self) -> ParseResult<Expr> {
        let condition = self.parse_nil_coalesce()?;
        if self.check(TokenKind::Question) {
            let line = self.line();
            self.advance();
            let then_value = self.parse_expression()?;
            self.consume(TokenKind::Colon, "Expected ':' in ternary expression")?;
            let else_value = self.parse_ternary()?;
            return Ok(Expr::Ternary {
                condition: Box::new(condition),
                then_value: Box::new(then_value),
                else_value: Box::new(else_value),
                line,
            });
        }
        Ok(condition)
    }

    fn parse_nil_coalesce(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_logical_or()?;
        while self.check(TokenKind::QuestionQuestion) {
            let line = self.line();
            self.advance();
            let right = self.parse_logical_or()?;
            expr = Expr::Binary {
                op: BinaryOp::NilCoalesce,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn parse_logical_or(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_logical_and()?;
        while self.check(TokenKind::PipePipe) {
            let line = self.line();
            self.advance();
            let right = self.parse_logical_and()?;
            expr = Expr::Binary {
                op: BinaryOp::LogicalOr,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn parse_logical_and(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_bit_or()?;
        while self.check(TokenKind::AmpAmp) {
            let line = self.line();
            self.advance();
            let right = self.parse_bit_or()?;
            expr = Expr::Binary {
                op: BinaryOp::LogicalAnd,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn parse_bit_or(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_bit_xor()?;
        while self.check(TokenKind::Pipe) {
            let line = self.line();
            self.advance();
            let right = self.parse_bit_xor()?;
            expr = Expr::Binary {
                op: BinaryOp::BitOr,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn parse_bit_xor(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_bit_and()?;
        while self.check(TokenKind::Caret) {
            let line = self.line();
            self.advance();
            let right = self.parse_bit_and()?;
            expr = Expr::Binary {
                op: BinaryOp::BitXor,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn parse_bit_and(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_equality()?;
        while self.check(TokenKind::Amp) {
            let line = self.line();
            self.advance();
            let right = self.parse_equality()?;
            expr = Expr::Binary {
                op: BinaryOp::BitAnd,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn parse_equality(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_type_ops()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::EqualEqual => BinaryOp::Equal,
                TokenKind::NotEqual => BinaryOp::NotEqual,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let right = self.parse_type_ops()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn parse_type_ops(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_comparison()?;
        loop {
            if self.check(TokenKind::Is) {
                let line = self.line();
                self.advance();
                let target = self.parse_type_annotation()?;
                expr = Expr::TypeCheck {
                    value: Box::new(expr),
                    target,
                    line,
                };
            } else if self.check(TokenKind::As) {
                let line = self.line();
                self.advance();
                let kind = if self.matches(TokenKind::Question) {
                    CastKind::Optional
                } else if self.matches(TokenKind::Bang) {
                    CastKind::Forced
                } else {
                    CastKind::Plain
                };
                let target = self.parse_type_annotation()?;
                expr = Expr::TypeCast {
                    value: Box::new(expr),
                    target,
                    kind,
                    line,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_comparison(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_shift()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Less => BinaryOp::Less,
                TokenKind::LessEqual => BinaryOp::LessEqual,
                TokenKind::Greater => BinaryOp::Greater,
                TokenKind::GreaterEqual => BinaryOp::GreaterEqual,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let right = self.parse_shift()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn parse_shift(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_range()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::LeftShift => BinaryOp::LeftShift,
                TokenKind::RightShift => BinaryOp::RightShift,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let right = self.parse_range()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn parse_range(&mut self) -> ParseResult<Expr> {
        let start = self.parse_additive()?;
        let inclusive = match self.peek().kind {
            TokenKind::RangeInclusive | TokenKind::Range => true,
            TokenKind::RangeExclusive => false,
            _ => return Ok(start),
        };
        let line = self.line();
        self.advance();
        let end = self.parse_additive()?;
        Ok(Expr::Range {
            start: Box::new(start),
            end: Box::new(end),
            inclusive,
            line,
        })
    }

    fn parse_additive(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let right = self.parse_multiplicative()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn parse_multiplicative(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let right = self.parse_unary()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        let op = match self.peek().kind {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            let line = self.line();
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
                line,
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek().kind {
                TokenKind::Bang => {
                    let line = self.line();
                    self.advance();
                    expr = Expr::ForceUnwrap {
                        operand: Box::new(expr),
                        line,
                    };
                }
                TokenKind::QuestionDot => {
                    let line = self.line();
                    self.advance();
                    let name = self.member_name("Expected member name after '?.'")?;
                    expr = Expr::OptionalMember {
                        object: Box::new(expr),
                        name,
                        line,
                    };
                }
                TokenKind::Dot => {
                    let line = self.line();
                    self.advance();
                    if self.check(TokenKind::Integer) {
                        let token = self.advance();
                        let index = u16::try_from(token.int_value)
                            .map_err(|_| ParseError::new("Tuple index out of range", line, token.column))?;
                        expr = Expr::TupleIndex {
                            object: Box::new(expr),
                            index,
                            line,
                        };
                    } else if self.check(TokenKind::Init) {
                        self.advance();
                        expr = Expr::Member {
                            object: Box::new(expr),
                            name: "init".to_owned(),
                            line,
                        };
                    } else {
                        let name = self.member_name("Expected member name after '.'")?;
                        expr = Expr::Member {
                            object: Box::new(expr),
                            name,
                            line,
                        };
                    }
                }
                TokenKind::LeftParen => {
                    let line = self.line();
                    self.advance();
                    let args = self.parse_call_args()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        line,
                    };
                }
                TokenKind::LeftBracket => {
                    let line = self.line();
                    self.advance();
                    let index = self.parse_expression()?;
                    self.consume(TokenKind::RightBracket, "Expected ']' after subscript index")?;
                    expr = Expr::Subscript {
                        object: Box::new(expr),
                        index: Box::new(index),
                        line,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// Member names accept soft keywords (`get`, `set`, `willSet`,
    /// `didSet`, `lazy`) since they are only reserved in accessor position.
    fn member_name(&mut self, message: &str) -> ParseResult<String> {
        if self.check(TokenKind::Identifier) || self.peek().kind.is_soft_keyword() {
            Ok(self.advance().lexeme.clone())
        } else {
            Err(self.error_here(message))
        }
    }

    fn parse_call_args(&mut self) -> ParseResult<Vec<CallArg>> {
        let mut args = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                let label = if self.check(TokenKind::Identifier) && self.check_at(1, TokenKind::Colon) {
                    let label = self.advance().lexeme.clone();
                    self.advance(); // :
                    Some(label)
                } else {
                    None
                };
                let value = self.parse_expression()?;
                args.push(CallArg { label, value });
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after arguments")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        match self.peek().kind {
            TokenKind::Integer => {
                let token = self.advance();
                Ok(Expr::IntLiteral {
                    value: token.int_value,
                    line,
                })
            }
            TokenKind::Float => {
                let token = self.advance();
                Ok(Expr::FloatLiteral {
                    value: token.float_value,
                    line,
                })
            }
            TokenKind::String => {
                let token = self.advance();
                Ok(Expr::StringLiteral {
                    value: decode_string_literal(&token.lexeme),
                    line,
                })
            }
            TokenKind::InterpolatedStringStart => self.parse_interpolated_string(),
            TokenKind::True => {
                self.advance();
                Ok(Expr::BoolLiteral { value: true, line })
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::BoolLiteral { value: false, line })
            }
            TokenKind::Nil => {
                self.advance();
                Ok(Expr::NilLiteral { line })
            }
            TokenKind::SelfKw => {
                self.advance();
                Ok(Expr::SelfExpr { line })
            }
            TokenKind::Super => {
                self.advance();
                Ok(Expr::SuperExpr { line })
            }
            TokenKind::Try => {
                // `try expr` is reserved syntax; the expression stands alone.
                self.advance();
                self.parse_unary()
            }
            TokenKind::Identifier => {
                let name = self.advance().lexeme.clone();
                if self.check(TokenKind::Less) && self.generic_args_ahead() {
                    self.advance(); // <
                    let mut args = Vec::new();
                    loop {
                        args.push(self.parse_type_annotation()?);
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect_generic_close()?;
                    return Ok(Expr::GenericSpecialization { base: name, args, line });
                }
                Ok(Expr::Identifier { name, line })
            }
            TokenKind::Dot if self.check_at(1, TokenKind::Identifier) => {
                self.advance();
                let name = self.advance().lexeme.clone();
                Ok(Expr::ImplicitMember { name, line })
            }
            TokenKind::LeftParen => self.parse_paren_expr(),
            TokenKind::LeftBracket => self.parse_bracket_literal(),
            TokenKind::LeftBrace => self.parse_closure(),
            _ => Err(self.error_here("Expected expression")),
        }
    }

    fn parse_interpolated_string(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        self.consume(TokenKind::InterpolatedStringStart, "Expected string start")?;

        // Lowered to a `+` concatenation chain seeded with an empty string so
        // the whole chain is string-typed regardless of the first part.
        let mut expr = Expr::StringLiteral {
            value: String::new(),
            line,
        };
        loop {
            match self.peek().kind {
                TokenKind::StringSegment => {
                    let token = self.advance();
                    let segment = Expr::StringLiteral {
                        value: decode_escapes(&token.lexeme),
                        line: token.line,
                    };
                    expr = concat(expr, segment, line);
                }
                TokenKind::InterpolationStart => {
                    self.advance();
                    let inner = self.parse_expression()?;
                    self.consume(TokenKind::InterpolationEnd, "Expected ')' to close interpolation")?;
                    expr = concat(expr, inner, line);
                }
                TokenKind::InterpolatedStringEnd => {
                    self.advance();
                    break;
                }
                _ => return Err(self.error_here("Malformed interpolated string")),
            }
        }
        Ok(expr)
    }

    /// `(` in expression position: tuple literal when the first comma comes
    /// before the matching `)` or a `label:` prefix is present; otherwise
    /// grouping.
    fn parse_paren_expr(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        self.consume(TokenKind::LeftParen, "Expected '('")?;

        if self.check(TokenKind::RightParen) {
            self.advance();
            return Ok(Expr::TupleLiteral {
                elements: Vec::new(),
                line,
            });
        }

        let first_label = if self.check(TokenKind::Identifier) && self.check_at(1, TokenKind::Colon) {
            let label = self.advance().lexeme.clone();
            self.advance();
            Some(label)
        } else {
            None
        };

        let first = self.parse_expression()?;

        if first_label.is_some() || self.check(TokenKind::Comma) {
            let mut elements = vec![(first_label, first)];
            while self.matches(TokenKind::Comma) {
                let label = if self.check(TokenKind::Identifier) && self.check_at(1, TokenKind::Colon) {
                    let label = self.advance().lexeme.clone();
                    self.advance();
                    Some(label)
                } else {
                    None
                };
                let value = self.parse_expression()?;
                elements.push((label, value));
            }
            self.consume(TokenKind::RightParen, "Expected ')' after tuple elements")?;
            return Ok(Expr::TupleLiteral { elements, line });
        }

        self.consume(TokenKind::RightParen, "Expected ')' after expression")?;
        Ok(Expr::Grouping {
            inner: Box::new(first),
            line,
        })
    }

    /// `[` in expression position: array literal, dictionary literal, or the
    /// empty dictionary `[:]`.
    fn parse_bracket_literal(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        self.consume(TokenKind::LeftBracket, "Expected '['")?;

        if self.matches(TokenKind::Colon) {
            self.consume(TokenKind::RightBracket, "Expected ']' after ':' in empty dictionary")?;
            return Ok(Expr::DictLiteral {
                entries: Vec::new(),
                line,
            });
        }

        if self.check(TokenKind::RightBracket) {
            self.advance();
            return Ok(Expr::ArrayLiteral {
                elements: Vec::new(),
                line,
            });
        }

        let first = self.parse_expression()?;
        if self.matches(TokenKind::Colon) {
            let first_value = self.parse_expression()?;
            let mut entries = vec![(first, first_value)];
            while self.matches(TokenKind::Comma) {
                let key = self.parse_expression()?;
                self.consume(TokenKind::Colon, "Expected ':' in dictionary literal")?;
                let value = self.parse_expression()?;
                entries.push((key, value));
            }
            self.consume(TokenKind::RightBracket, "Expected ']' after dictionary literal")?;
            return Ok(Expr::DictLiteral { entries, line });
        }

        let mut elements = vec![first];
        while self.matches(TokenKind::Comma) {
            elements.push(self.parse_expression()?);
        }
        self.consume(TokenKind::RightBracket, "Expected ']' after array literal")?;
        Ok(Expr::ArrayLiteral { elements, line })
    }

    /// `{` in expression position begins a closure; an optional parameter
    /// list `(name: Type, ...) -> Type in` or bare `a, b in` precedes the
    /// body.
    fn parse_closure(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        self.consume(TokenKind::LeftBrace, "Expected '{'")?;

        let mut params = Vec::new();
        let mut return_type = None;

        let checkpoint = self.current;

        if self.check(TokenKind::LeftParen) {
            if let Ok(parsed) = self.parse_param_list() {
                let ret = if self.matches(TokenKind::Arrow) {
                    self.parse_type_annotation().ok()
                } else {
                    None
                };
                if self.matches(TokenKind::In) {
                    params = parsed;
                    return_type = ret;
                } else {
                    self.current = checkpoint;
                }
            } else {
                self.current = checkpoint;
            }
        } else if self.check(TokenKind::Identifier) {
            // Bare name list: `a, b in`.
            let mut names = vec![self.peek().lexeme.clone()];
            let mut i = 1;
            loop {
                if self.check_at(i, TokenKind::Comma) && self.check_at(i + 1, TokenKind::Identifier) {
                    names.push(self.peek_at(i + 1).lexeme.clone());
                    i += 2;
                } else {
                    break;
                }
            }
            if self.check_at(i, TokenKind::In) {
                for _ in 0..=i {
                    self.advance();
                }
                params = names
                    .into_iter()
                    .map(|name| Param {
                        label: None,
                        name,
                        type_annotation: None,
                        default_value: None,
                        label_omitted: true,
                    })
                    .collect();
            }
        }

        let mut body = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.at_end() {
            body.push(self.parse_statement()?);
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after closure body")?;

        Ok(Expr::Closure {
            params,
            return_type,
            body,
            line,
        })
    }

    // ---- Types ----

    pub fn parse_type_annotation(&mut self) -> ParseResult<TypeAnnotation> {
        let line = self.line();

        // Function type or parenthesized type: `(Int, String) -> Bool`.
        if self.matches(TokenKind::LeftParen) {
            let mut params = Vec::new();
            if !self.check(TokenKind::RightParen) {
                loop {
                    params.push(self.parse_type_annotation()?);
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.consume(TokenKind::RightParen, "Expected ')' in type")?;
            if self.matches(TokenKind::Arrow) {
                let ret = self.parse_type_annotation()?;
                let mut annotation = TypeAnnotation::named("Function", line);
                annotation.function = Some(FunctionTypeAnnotation {
                    params,
                    ret: Box::new(ret),
                });
                return Ok(self.parse_optional_suffix(annotation));
            }
            if params.len() == 1 {
                let inner = params.into_iter().next().expect("length checked");
                return Ok(self.parse_optional_suffix(inner));
            }
            return Ok(self.parse_optional_suffix(TypeAnnotation::named("Void", line)));
        }

        // Collection sugar: `[T]` and `[K: V]`.
        if self.matches(TokenKind::LeftBracket) {
            let first = self.parse_type_annotation()?;
            if self.matches(TokenKind::Colon) {
                let value = self.parse_type_annotation()?;
                self.consume(TokenKind::RightBracket, "Expected ']' in dictionary type")?;
                let mut annotation = TypeAnnotation::named("Dictionary", line);
                annotation.generic_args = vec![first, value];
                return Ok(self.parse_optional_suffix(annotation));
            }
            self.consume(TokenKind::RightBracket, "Expected ']' in array type")?;
            let mut annotation = TypeAnnotation::named("Array", line);
            annotation.generic_args = vec![first];
            return Ok(self.parse_optional_suffix(annotation));
        }

        let name = self.consume(TokenKind::Identifier, "Expected type name")?;
        let mut annotation = TypeAnnotation::named(name.lexeme, line);

        if self.matches(TokenKind::Less) {
            loop {
                annotation.generic_args.push(self.parse_type_annotation()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.expect_generic_close()?;
        }

        Ok(self.parse_optional_suffix(annotation))
    }

    fn parse_optional_suffix(&mut self, mut annotation: TypeAnnotation) -> TypeAnnotation {
        while self.check(TokenKind::Question) {
            annotation.is_optional = true;
            self.advance();
        }
        annotation
    }

    /// Consumes one closing `>` of a generic argument list, splitting a `>>`
    /// token into two `>` when it closes two levels at once.
    fn expect_generic_close(&mut self) -> ParseResult<()> {
        if self.matches(TokenKind::Greater) {
            return Ok(());
        }
        if self.check(TokenKind::RightShift) {
            let token = self.peek();
            let replacement = Token::synthetic(TokenKind::Greater, ">", token.line, token.column + 1);
            self.tokens[self.current] = replacement;
            // The first `>` is consumed implicitly; the synthesized one stays
            // at the cursor for the enclosing list.
            return Ok(());
        }
        Err(self.error_here("Expected '>' to close generic arguments"))
    }

    /// Speculative scan deciding whether `<` at the cursor begins generic
    /// arguments: a matching `>` must appear while only type-ish tokens are
    /// seen, before any statement-terminating token.
    fn generic_args_ahead(&self) -> bool {
        debug_assert!(self.check(TokenKind::Less));
        let mut depth = 0i32;
        let mut i = self.current;
        let limit = (self.current + 64).min(self.tokens.len());
        while i < limit {
            match self.tokens[i].kind {
                TokenKind::Less => depth += 1,
                TokenKind::Greater => {
                    depth -= 1;
                    if depth == 0 {
                        return true;
                    }
                }
                TokenKind::RightShift => {
                    depth -= 2;
                    if depth <= 0 {
                        return true;
                    }
                }
                TokenKind::Identifier
                | TokenKind::Comma
                | TokenKind::Dot
                | TokenKind::Question
                | TokenKind::LeftBracket
                | TokenKind::RightBracket
                | TokenKind::Colon
                | TokenKind::Arrow
                | TokenKind::LeftParen
                | TokenKind::RightParen => {}
                _ => return false,
            }
            i += 1;
        }
        false
    }
}

impl TokenKind {
    /// Keywords that are only reserved in accessor position and may
    /// otherwise name members and functions.
    #[must_use]
    pub fn is_soft_keyword(self) -> bool {
        matches!(
            self,
            Self::Get | Self::Set | Self::WillSet | Self::DidSet | Self::Lazy
        )
    }

    /// Token kinds usable as operator function names (`func +`, `func ==`).
    #[must_use]
    pub fn is_operator_name(self) -> bool {
        matches!(
            self,
            Self::Plus
                | Self::Minus
                | Self::Star
                | Self::Slash
                | Self::Percent
                | Self::EqualEqual
                | Self::NotEqual
                | Self::Less
                | Self::LessEqual
                | Self::Greater
                | Self::GreaterEqual
                | Self::Amp
                | Self::Pipe
                | Self::Caret
                | Self::LeftShift
                | Self::RightShift
        )
    }
}

fn compound_op(kind: TokenKind) -> BinaryOp {
    match kind {
        TokenKind::PlusEqual => BinaryOp::Add,
        TokenKind::MinusEqual => BinaryOp::Sub,
        TokenKind::StarEqual => BinaryOp::Mul,
        TokenKind::SlashEqual => BinaryOp::Div,
        TokenKind::PercentEqual => BinaryOp::Mod,
        TokenKind::AmpEqual => BinaryOp::BitAnd,
        TokenKind::PipeEqual => BinaryOp::BitOr,
        TokenKind::CaretEqual => BinaryOp::BitXor,
        TokenKind::LeftShiftEqual => BinaryOp::LeftShift,
        TokenKind::RightShiftEqual => BinaryOp::RightShift,
        _ => unreachable!("not a compound assignment token"),
    }
}

fn concat(left: Expr, right: Expr, line: u32) -> Expr {
    Expr::Binary {
        op: BinaryOp::Add,
        left: Box::new(left),
        right: Box::new(right),
        line,
    }
}

/// Strips the surrounding quotes and decodes escape sequences.
fn decode_string_literal(lexeme: &str) -> String {
    let inner = lexeme
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(lexeme);
    decode_escapes(inner)
}

/// Decodes escape sequences in a raw (quote-free) string fragment.
fn decode_escapes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::lexer::Lexer;

    fn parse_source(source: &str) -> Vec<Stmt> {
        parse(Lexer::new(source).tokenize_all()).expect("parse failed")
    }

    fn parse_error(source: &str) -> ParseError {
        parse(Lexer::new(source).tokenize_all()).expect_err("expected parse failure")
    }

    #[test]
    fn parses_let_with_initializer() {
        let program = parse_source("let x = 10");
        let Stmt::Var(decl) = &program[0] else {
            panic!("expected var declaration");
        };
        assert!(decl.is_let);
        assert_eq!(decl.name, "x");
        assert!(matches!(decl.initializer, Some(Expr::IntLiteral { value: 10, .. })));
    }

    #[test]
    fn precedence_mul_over_add() {
        let program = parse_source("1 + 2 * 3");
        let Stmt::Expression { expr, .. } = &program[0] else {
            panic!("expected expression");
        };
        let Expr::Binary { op, right, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(**right, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn shift_binds_looser_than_additive() {
        let program = parse_source("1 << 2 + 3");
        let Stmt::Expression { expr, .. } = &program[0] else {
            panic!("expected expression");
        };
        assert!(matches!(expr, Expr::Binary {
            op: BinaryOp::LeftShift,
            ..
        }));
    }

    #[test]
    fn paren_with_comma_is_tuple() {
        let program = parse_source("(1, 2)");
        let Stmt::Expression { expr, .. } = &program[0] else {
            panic!("expected expression");
        };
        assert!(matches!(expr, Expr::TupleLiteral { .. }));
    }

    #[test]
    fn labeled_paren_is_tuple() {
        let program = parse_source("(x: 1)");
        let Stmt::Expression { expr, .. } = &program[0] else {
            panic!("expected expression");
        };
        let Expr::TupleLiteral { elements, .. } = expr else {
            panic!("expected tuple literal");
        };
        assert_eq!(elements[0].0.as_deref(), Some("x"));
    }

    #[test]
    fn plain_paren_is_grouping() {
        let program = parse_source("(1 + 2)");
        let Stmt::Expression { expr, .. } = &program[0] else {
            panic!("expected expression");
        };
        assert!(matches!(expr, Expr::Grouping { .. }));
    }

    #[test]
    fn empty_dictionary_literal() {
        let program = parse_source("[:]");
        let Stmt::Expression { expr, .. } = &program[0] else {
            panic!("expected expression");
        };
        assert!(matches!(expr, Expr::DictLiteral { entries, .. } if entries.is_empty()));
    }

    #[test]
    fn dictionary_vs_array() {
        let program = parse_source("[1: 2]\n[1, 2]");
        assert!(matches!(&program[0], Stmt::Expression {
            expr: Expr::DictLiteral { .. },
            ..
        }));
        assert!(matches!(&program[1], Stmt::Expression {
            expr: Expr::ArrayLiteral { .. },
            ..
        }));
    }

    #[test]
    fn interpolated_string_lowers_to_concat() {
        let program = parse_source(r#"print("a\(x)b")"#);
        let Stmt::Print { expr, .. } = &program[0] else {
            panic!("expected print");
        };
        // (("" + "a") + x) + "b"
        let Expr::Binary { op: BinaryOp::Add, .. } = expr else {
            panic!("expected concat chain");
        };
    }

    #[test]
    fn generic_specialization_in_expression() {
        let program = parse_source("Stack<Int>()");
        let Stmt::Expression { expr, .. } = &program[0] else {
            panic!("expected expression");
        };
        let Expr::Call { callee, .. } = expr else {
            panic!("expected call");
        };
        assert!(matches!(&**callee, Expr::GenericSpecialization { base, args, .. }
            if base == "Stack" && args.len() == 1));
    }

    #[test]
    fn less_than_is_not_generic() {
        let program = parse_source("a < b");
        let Stmt::Expression { expr, .. } = &program[0] else {
            panic!("expected expression");
        };
        assert!(matches!(expr, Expr::Binary { op: BinaryOp::Less, .. }));
    }

    #[test]
    fn nested_generic_type_splits_right_shift() {
        let program = parse_source("var x: Box<Box<Int>> = y");
        let Stmt::Var(decl) = &program[0] else {
            panic!("expected var");
        };
        let annotation = decl.type_annotation.as_ref().expect("has annotation");
        assert_eq!(annotation.name, "Box");
        assert_eq!(annotation.generic_args[0].name, "Box");
        assert_eq!(annotation.generic_args[0].generic_args[0].name, "Int");
    }

    #[test]
    fn switch_with_enum_patterns_and_bindings() {
        let source = "switch r { case .ok(let v): print(v)  case .err(let e): print(e) }";
        let program = parse_source(source);
        let Stmt::Switch { cases, default, .. } = &program[0] else {
            panic!("expected switch");
        };
        assert_eq!(cases.len(), 2);
        assert!(default.is_none());
        let Pattern::EnumCase { name, bindings, .. } = &cases[0].patterns[0] else {
            panic!("expected enum pattern");
        };
        assert_eq!(name, "ok");
        assert_eq!(bindings[0].name.as_deref(), Some("v"));
    }

    #[test]
    fn guard_requires_else() {
        let err = parse_error("guard let x = y { }");
        assert!(err.message.contains("else"));
    }

    #[test]
    fn closure_with_typed_params() {
        let program = parse_source("let f = { (a: Int, b: Int) -> Int in return a + b }");
        let Stmt::Var(decl) = &program[0] else {
            panic!("expected var");
        };
        let Some(Expr::Closure { params, return_type, .. }) = &decl.initializer else {
            panic!("expected closure initializer");
        };
        assert_eq!(params.len(), 2);
        assert!(return_type.is_some());
    }

    #[test]
    fn closure_with_bare_params() {
        let program = parse_source("let f = { a, b in a }");
        let Stmt::Var(decl) = &program[0] else {
            panic!("expected var");
        };
        let Some(Expr::Closure { params, .. }) = &decl.initializer else {
            panic!("expected closure initializer");
        };
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn class_with_members() {
        let source = "class P { private var ssn = \"X\"\n var name = \"John\"\n init() { }\n func hi() -> String { return name }\n deinit { print(\"bye\") } }";
        let program = parse_source(source);
        let Stmt::Class(decl) = &program[0] else {
            panic!("expected class");
        };
        assert_eq!(decl.properties.len(), 2);
        assert_eq!(decl.properties[0].access, AccessLevel::Private);
        assert_eq!(decl.initializers.len(), 1);
        assert_eq!(decl.methods.len(), 1);
        assert!(decl.deinitializer.is_some());
    }

    #[test]
    fn enum_with_associated_values() {
        let program = parse_source("enum R { case ok(v: Int)\n case err(e: Int) }");
        let Stmt::Enum(decl) = &program[0] else {
            panic!("expected enum");
        };
        assert_eq!(decl.cases.len(), 2);
        assert_eq!(decl.cases[0].assoc[0].0.as_deref(), Some("v"));
    }

    #[test]
    fn mutating_struct_method() {
        let program = parse_source("struct C { var n: Int = 0\n mutating func inc() { self.n = self.n + 1 } }");
        let Stmt::Struct(decl) = &program[0] else {
            panic!("expected struct");
        };
        assert!(decl.methods[0].is_mutating);
    }

    #[test]
    fn error_reports_position() {
        let err = parse_error("let = 5");
        assert_eq!(err.line, 1);
        assert!(err.message.contains("variable name"));
    }

    #[test]
    fn lex_error_surfaces_as_parse_error() {
        let err = parse_error("let s = \"abc");
        assert_eq!(err.message, "Unterminated string");
    }

    #[test]
    fn optional_chain_and_force_unwrap() {
        let program = parse_source("a?.b!.c");
        let Stmt::Expression { expr, .. } = &program[0] else {
            panic!("expected expression");
        };
        assert!(matches!(expr, Expr::Member { .. }));
    }

    #[test]
    fn compound_assignment_desugars_later() {
        let program = parse_source("x += 1");
        assert!(matches!(&program[0], Stmt::Expression {
            expr: Expr::CompoundAssign {
                op: BinaryOp::Add,
                ..
            },
            ..
        }));
    }

    #[test]
    fn tuple_destructuring() {
        let program = parse_source("let (a, b) = pair");
        assert!(matches!(&program[0], Stmt::TupleDestructure { names, is_let: true, .. }
            if names.len() == 2));
    }

    #[test]
    fn for_with_where_clause() {
        let program = parse_source("for i in 1..<3 where i > 1 { print(i) }");
        let Stmt::ForIn {
            where_clause, iterable, ..
        } = &program[0]
        else {
            panic!("expected for-in");
        };
        assert!(where_clause.is_some());
        assert!(matches!(iterable, Expr::Range { inclusive: false, .. }));
    }
}
