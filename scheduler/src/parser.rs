// Parser for loop-program source files.
//
// Parses a token stream (from the lexer) into `ProcDef`s. Uses chumsky
// combinators. After parsing, a name-binding pass turns bare buffer names
// into zero-dimensional reads (or whole-buffer windows in call arguments)
// and statements are numbered in pre-order.
//
// Preconditions: input is a valid token stream from `lexer::lex()`.
// Postconditions: returns procedures plus any parse errors (non-fatal).
// Failure modes: syntax errors produce `Rich` diagnostics.
// Side effects: none.

use std::collections::HashSet;

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::error::LoadError;
use crate::id::{NodeId, NodeIdAllocator};
use crate::lexer::Token;
use crate::memory::Memory;
use crate::walk;

/// Result of parsing: procedures plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub procs: Vec<ProcDef>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse a loop-program source string. Lexes then parses.
pub fn parse(source: &str) -> ParseResult {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    // Convert lexer output to chumsky stream.
    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = program_parser(source);
    let (procs, parse_errors) = parser.parse(stream).into_output_errors();

    // Merge lex errors + parse errors.
    let mut all_errors: Vec<Rich<'static, Token, SimpleSpan>> = lex_result
        .errors
        .into_iter()
        .map(|e| {
            let span: SimpleSpan = (e.span.start..e.span.end).into();
            Rich::custom(span, e.message)
        })
        .collect();
    all_errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));

    ParseResult {
        procs: procs
            .unwrap_or_default()
            .into_iter()
            .map(bind_names)
            .collect(),
        errors: all_errors,
    }
}

/// Parse every procedure in `source`, failing on the first syntax error.
pub fn parse_procs(source: &str) -> Result<Vec<ProcDef>, LoadError> {
    let result = parse(source);
    match LoadError::from_syntax(&result.errors) {
        Some(err) => Err(err),
        None => Ok(result.procs),
    }
}

/// Parse a source that holds exactly one procedure.
pub fn parse_proc(source: &str) -> Result<ProcDef, LoadError> {
    let mut procs = parse_procs(source)?;
    if procs.len() != 1 {
        return Err(LoadError::ProcCount { found: procs.len() });
    }
    Ok(procs.remove(0))
}

// ── Main parser builder ──
//
// All grammar rules are built inside `program_parser` so that the `source`
// reference is captured once and shared by all combinators.

fn program_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, Vec<ProcDef>, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    // ── Identifier ──

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        source[span.start()..span.end()].to_string()
    });

    // ── Expressions ──
    //
    // Precedence, loosest first: `||`, `&&`, comparisons, `+ -`, `* / %`,
    // unary minus. All binary levels are left-associative.

    let expr = recursive(|expr| {
        let index = expr
            .clone()
            .separated_by(just(Token::Comma))
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LBracket), just(Token::RBracket));

        let atom = choice((
            select! { Token::Int(n) => Expr::Int(n) },
            ident.clone().then(index.or_not()).map(|(name, idx)| match idx {
                Some(idx) => Expr::Read(Access { buf: name, idx }),
                None => Expr::Var(name),
            }),
            expr.clone()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        ));

        // `-3` is a literal; `-x` is a negation.
        let unary = just(Token::Minus)
            .repeated()
            .foldr(atom, |_, operand| match operand {
                Expr::Int(n) => Expr::Int(-n),
                other => Expr::Neg(Box::new(other)),
            })
            .boxed();

        let product = unary
            .clone()
            .foldl(
                choice((
                    just(Token::Star).to(BinOp::Mul),
                    just(Token::Slash).to(BinOp::Div),
                    just(Token::Percent).to(BinOp::Mod),
                ))
                .then(unary)
                .repeated(),
                |lhs, (op, rhs)| Expr::bin(op, lhs, rhs),
            )
            .boxed();

        let sum = product
            .clone()
            .foldl(
                choice((
                    just(Token::Plus).to(BinOp::Add),
                    just(Token::Minus).to(BinOp::Sub),
                ))
                .then(product)
                .repeated(),
                |lhs, (op, rhs)| Expr::bin(op, lhs, rhs),
            )
            .boxed();

        let comparison = sum
            .clone()
            .foldl(
                choice((
                    just(Token::Le).to(BinOp::Le),
                    just(Token::Lt).to(BinOp::Lt),
                    just(Token::Ge).to(BinOp::Ge),
                    just(Token::Gt).to(BinOp::Gt),
                    just(Token::EqEq).to(BinOp::Eq),
                ))
                .then(sum)
                .repeated(),
                |lhs, (op, rhs)| Expr::bin(op, lhs, rhs),
            )
            .boxed();

        let conjunction = comparison
            .clone()
            .foldl(
                just(Token::AndAnd).to(BinOp::And).then(comparison).repeated(),
                |lhs, (op, rhs)| Expr::bin(op, lhs, rhs),
            )
            .boxed();

        conjunction.clone().foldl(
            just(Token::OrOr).to(BinOp::Or).then(conjunction).repeated(),
            |lhs, (op, rhs)| Expr::bin(op, lhs, rhs),
        )
    });

    let index = expr
        .clone()
        .separated_by(just(Token::Comma))
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LBracket), just(Token::RBracket));

    // ── Buffer declarations: `i32[4, n] @ DRAM` ──

    let scalar_ty = ident.clone().try_map(|name, span| {
        ScalarType::from_name(&name).ok_or_else(|| {
            Rich::custom(
                span,
                format!("expected element type (i8, i32, f32, f64), found '{}'", name),
            )
        })
    });

    let memory = ident
        .clone()
        .try_map(|name, span| name.parse::<Memory>().map_err(|msg| Rich::custom(span, msg)));

    let decl = scalar_ty
        .then(index.clone().or_not())
        .then(just(Token::At).ignore_then(memory).or_not())
        .map(|((ty, shape), mem)| BufferDecl {
            ty,
            shape: shape.unwrap_or_default(),
            mem: mem.unwrap_or(Memory::Dram),
        });

    // ── Parameters: `n: size` | `a: i32[n] @ DRAM` ──

    let size_kind = ident
        .clone()
        .filter(|name: &String| name == "size")
        .to(ParamKind::Size);

    let param = ident
        .clone()
        .then_ignore(just(Token::Colon))
        .then(size_kind.or(decl.clone().map(ParamKind::Buffer)))
        .map(|(name, kind)| Param { name, kind });

    let params = param
        .separated_by(just(Token::Comma))
        .allow_trailing()
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LParen), just(Token::RParen));

    // ── Statements ──

    let stmt = recursive(|stmt| {
        let block = stmt
            .repeated()
            .collect::<Vec<Stmt>>()
            .delimited_by(just(Token::LBrace), just(Token::RBrace));

        let for_loop = just(Token::For)
            .ignore_then(ident.clone())
            .then_ignore(just(Token::In))
            .then_ignore(just(Token::Seq))
            .then(
                expr.clone()
                    .then_ignore(just(Token::Comma))
                    .then(expr.clone())
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .then(block.clone())
            .map(|((var, (lo, hi)), body)| StmtKind::For(ForLoop { var, lo, hi, body }));

        let if_stmt = just(Token::If)
            .ignore_then(expr.clone())
            .then(block.clone())
            .then(just(Token::Else).ignore_then(block).or_not())
            .map(|((cond, body), orelse)| {
                StmtKind::If(IfStmt {
                    cond,
                    body,
                    orelse: orelse.unwrap_or_default(),
                })
            });

        let pass = just(Token::Pass)
            .then_ignore(just(Token::Semi))
            .to(StmtKind::Pass);

        let alloc = ident
            .clone()
            .then_ignore(just(Token::Colon))
            .then(decl.clone())
            .then_ignore(just(Token::Semi))
            .map(|(name, decl)| StmtKind::Alloc(Alloc { name, decl }));

        // Window argument: `buf[lo:hi, p]`, only as a whole call argument.
        let window_dim = expr
            .clone()
            .then(just(Token::Colon).ignore_then(expr.clone()).or_not())
            .map(|(lo, hi)| match hi {
                Some(hi) => WindowDim::Interval(lo, hi),
                None => WindowDim::Point(lo),
            });
        let window = ident
            .clone()
            .then(
                window_dim
                    .separated_by(just(Token::Comma))
                    .collect::<Vec<_>>()
                    .delimited_by(just(Token::LBracket), just(Token::RBracket)),
            )
            .then_ignore(just(Token::Comma).or(just(Token::RParen)).rewind())
            .map(|(buf, dims)| Expr::Window(Window { buf, dims }));

        let call = ident
            .clone()
            .then(
                window
                    .or(expr.clone())
                    .separated_by(just(Token::Comma))
                    .collect::<Vec<_>>()
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .then_ignore(just(Token::Semi))
            .map(|(instr, args)| StmtKind::Call(Call { instr, args }));

        let store = ident
            .clone()
            .then(index.clone().or_not())
            .then(
                just(Token::Equals)
                    .to(false)
                    .or(just(Token::PlusEquals).to(true)),
            )
            .then(expr.clone())
            .then_ignore(just(Token::Semi))
            .map(|(((buf, idx), reduce), rhs)| {
                let store = Store {
                    lhs: Access {
                        buf,
                        idx: idx.unwrap_or_default(),
                    },
                    rhs,
                };
                if reduce {
                    StmtKind::Reduce(store)
                } else {
                    StmtKind::Assign(store)
                }
            });

        choice((for_loop, if_stmt, pass, alloc, call, store))
            .map(|kind| Stmt::new(NodeId(0), kind))
            .boxed()
    });

    // ── Procedure ──

    let proc_def = just(Token::Proc)
        .ignore_then(ident)
        .then(params)
        .then(
            stmt.repeated()
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LBrace), just(Token::RBrace)),
        )
        .map(|((name, params), body)| ProcDef { name, params, body });

    proc_def.repeated().collect::<Vec<_>>()
}

// ── Name binding ──

/// Resolve bare buffer names and number statements in pre-order.
fn bind_names(mut def: ProcDef) -> ProcDef {
    let mut buffers: HashSet<String> = def
        .params
        .iter()
        .filter(|p| matches!(p.kind, ParamKind::Buffer(_)))
        .map(|p| p.name.clone())
        .collect();
    walk::visit_stmts(&def.body, &mut |s| {
        if let Some(a) = s.as_alloc() {
            buffers.insert(a.name.clone());
        }
    });

    walk::visit_stmts_mut(&mut def.body, &mut |s| {
        if let StmtKind::Call(call) = &mut s.kind {
            for arg in &mut call.args {
                if let Expr::Var(name) = arg {
                    if buffers.contains(name.as_str()) {
                        *arg = Expr::Window(Window {
                            buf: std::mem::take(name),
                            dims: Vec::new(),
                        });
                    }
                }
            }
        }
        for e in walk::stmt_exprs_mut(s) {
            walk::walk_expr_mut(e, &mut |sub| {
                if let Expr::Var(name) = sub {
                    if buffers.contains(name.as_str()) {
                        *sub = Expr::read(std::mem::take(name), Vec::new());
                    }
                }
            });
        }
    });

    let mut ids = NodeIdAllocator::new();
    walk::renumber(&mut def.body, &mut ids);
    def
}

// ── Tests ──
