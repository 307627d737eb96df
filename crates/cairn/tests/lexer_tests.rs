//! Tokenizer tests: modes, quoting, comments, and operator recognition.

use cairn::lex::{LexMode, Lexer, TokenKind};
use pretty_assertions::assert_eq;

fn kinds(text: &str) -> Vec<TokenKind> {
    let mut l = Lexer::new(text, "test");
    let mut r = Vec::new();
    loop {
        let t = l.next().expect("lex");
        let k = t.kind;
        r.push(k);
        if k == TokenKind::Eos {
            return r;
        }
    }
}

#[test]
fn assignment_operators() {
    assert_eq!(
        kinds("x = y\n"),
        vec![TokenKind::Word, TokenKind::Assign, TokenKind::Word, TokenKind::Newline, TokenKind::Eos]
    );
    assert_eq!(
        kinds("x += y\n")[1],
        TokenKind::Append
    );
    assert_eq!(
        kinds("x =+ y\n")[1],
        TokenKind::Prepend
    );
}

#[test]
fn dependency_punctuation() {
    assert_eq!(
        kinds("exe{hello}: cxx{hello}\n"),
        vec![
            TokenKind::Word,
            TokenKind::LCBrace,
            TokenKind::Word,
            TokenKind::RCBrace,
            TokenKind::Colon,
            TokenKind::Word,
            TokenKind::LCBrace,
            TokenKind::Word,
            TokenKind::RCBrace,
            TokenKind::Newline,
            TokenKind::Eos,
        ]
    );
}

#[test]
fn comments_run_to_end_of_line() {
    assert_eq!(
        kinds("x = 1 # trailing words = { } :\ny\n"),
        vec![
            TokenKind::Word,
            TokenKind::Assign,
            TokenKind::Word,
            TokenKind::Newline,
            TokenKind::Word,
            TokenKind::Newline,
            TokenKind::Eos,
        ]
    );
}

#[test]
fn multi_line_comment() {
    let text = "#\\\nanything = goes : here\n#\\\nx = 1\n";
    let k = kinds(text);
    assert_eq!(
        k,
        vec![TokenKind::Newline, TokenKind::Word, TokenKind::Assign, TokenKind::Word, TokenKind::Newline, TokenKind::Eos]
    );
}

#[test]
fn single_quotes_are_literal() {
    let mut l = Lexer::new("'a $x b'\n", "test");
    let t = l.next().unwrap();
    assert_eq!(t.kind, TokenKind::Word);
    assert_eq!(t.value, "a $x b");
    assert!(t.quoted);
}

#[test]
fn double_quotes_stop_at_expansion() {
    let mut l = Lexer::new("\"a $x b\"\n", "test");
    let t = l.next().unwrap();
    assert_eq!((t.kind, t.value.as_str()), (TokenKind::Word, "a "));
    let t = l.next().unwrap();
    assert_eq!(t.kind, TokenKind::Dollar);
    assert!(t.quoted);
}

#[test]
fn separation_is_tracked() {
    let mut l = Lexer::new("a b$c\n", "test");
    let a = l.next().unwrap();
    let b = l.next().unwrap();
    let d = l.next().unwrap();
    assert!(a.separated || a.value == "a");
    assert!(b.separated, "b follows whitespace");
    assert_eq!(d.kind, TokenKind::Dollar);
    assert!(!d.separated, "the dollar concatenates with the preceding word");
}

#[test]
fn eval_mode_operators() {
    let mut l = Lexer::new("($x == 5 && !$y || $z != 1)\n", "test");
    let t = l.next().unwrap();
    assert_eq!(t.kind, TokenKind::LParen);
    l.push_mode(LexMode::Eval);
    let mut seen = Vec::new();
    loop {
        let t = l.next().unwrap();
        if t.kind == TokenKind::RParen {
            break;
        }
        seen.push(t.kind);
    }
    assert!(seen.contains(&TokenKind::Equal));
    assert!(seen.contains(&TokenKind::LogAnd));
    assert!(seen.contains(&TokenKind::LogNot));
    assert!(seen.contains(&TokenKind::LogOr));
    assert!(seen.contains(&TokenKind::NotEqual));
}

#[test]
fn eval_mode_rejects_single_equals() {
    let mut l = Lexer::new("=", "test");
    l.push_mode(LexMode::Eval);
    assert!(l.next().is_err());
}

#[test]
fn value_mode_treats_assignment_as_words() {
    let mut l = Lexer::new("a=b\n", "test");
    l.push_mode(LexMode::Value);
    let t = l.next().unwrap();
    assert_eq!(t.value, "a=b");
}

#[test]
fn pair_separator() {
    let k = kinds("a@b\n");
    assert_eq!(k[1], TokenKind::PairSeparator);
}

#[test]
fn unterminated_quote_is_an_error() {
    let mut l = Lexer::new("'abc\n", "test");
    let e = l.next().unwrap_err();
    assert_eq!(e.kind, cairn::ErrorKind::Parse);
}

#[test]
fn line_continuation_joins_lines() {
    let k = kinds("a \\\nb\n");
    assert_eq!(k, vec![TokenKind::Word, TokenKind::Word, TokenKind::Newline, TokenKind::Eos]);
}

#[test]
fn locations_are_one_based() {
    let mut l = Lexer::new("\n  x", "test");
    let nl = l.next().unwrap();
    assert_eq!((nl.line, nl.column), (1, 1));
    let x = l.next().unwrap();
    assert_eq!((x.line, x.column), (2, 3));
}
