use super::{BinaryOp, Expr, ExprError, Func};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Field(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(n) => format!("number {n}"),
            Token::Field(name) => format!("field [{name}]"),
            Token::Ident(name) => format!("identifier '{name}'"),
            Token::Plus => "'+'".into(),
            Token::Minus => "'-'".into(),
            Token::Star => "'*'".into(),
            Token::Slash => "'/'".into(),
            Token::LParen => "'('".into(),
            Token::RParen => "')'".into(),
            Token::Comma => "','".into(),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '[' => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some((_, ']')) => break,
                        Some((p, '[')) => {
                            return Err(ExprError::UnexpectedToken {
                                pos: p,
                                found: "'[' inside a field reference".into(),
                            })
                        }
                        Some((_, ch)) => name.push(ch),
                        None => return Err(ExprError::UnexpectedEnd),
                    }
                }
                let name = name.trim();
                if name.is_empty() {
                    return Err(ExprError::UnexpectedToken {
                        pos,
                        found: "empty field reference".into(),
                    });
                }
                tokens.push((pos, Token::Field(name.to_string())));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut literal = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    let exponent_sign = matches!(ch, '+' | '-')
                        && literal.ends_with(['e', 'E']);
                    if ch.is_ascii_digit() || ch == '.' || ch == 'e' || ch == 'E' || exponent_sign {
                        literal.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = literal.parse::<f64>().map_err(|_| ExprError::UnexpectedToken {
                    pos,
                    found: format!("number '{literal}'"),
                })?;
                tokens.push((pos, Token::Number(value)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((pos, Token::Ident(ident)));
            }
            _ => {
                let token = match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    other => {
                        return Err(ExprError::UnexpectedToken {
                            pos,
                            found: format!("'{other}'"),
                        })
                    }
                };
                chars.next();
                tokens.push((pos, token));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, want: Token) -> Result<(), ExprError> {
        match self.next() {
            Some((_, t)) if t == want => Ok(()),
            Some((pos, t)) => Err(ExprError::UnexpectedToken {
                pos,
                found: t.describe(),
            }),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some((_, Token::Number(n))) => Ok(Expr::Number(n)),
            Some((_, Token::Field(name))) => Ok(Expr::Field(name)),
            Some((_, Token::LParen)) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some((_, Token::Ident(name))) => {
                let func = Func::lookup(&name).ok_or(ExprError::UnknownFunction(name))?;
                self.expect(Token::LParen)?;
                let mut args = vec![self.expr()?];
                while self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                    args.push(self.expr()?);
                }
                self.expect(Token::RParen)?;
                if args.len() != func.arity() {
                    return Err(ExprError::Arity {
                        func: func.name(),
                        expected: func.arity(),
                        found: args.len(),
                    });
                }
                Ok(Expr::Call { func, args })
            }
            Some((pos, t)) => Err(ExprError::UnexpectedToken {
                pos,
                found: t.describe(),
            }),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

/// Parse one right-hand-side expression.
pub fn parse_expression(text: &str) -> Result<Expr, ExprError> {
    let mut parser = Parser {
        tokens: tokenize(text)?,
        pos: 0,
    };
    let expr = parser.expr()?;
    match parser.next() {
        None => Ok(expr),
        Some((pos, t)) => Err(ExprError::UnexpectedToken {
            pos,
            found: t.describe(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str) -> Box<Expr> {
        Box::new(Expr::Field(name.into()))
    }

    #[test]
    fn precedence_and_associativity() {
        let e = parse_expression("[A] + [B] * 2 - [C]").unwrap();
        assert_eq!(e.to_string(), "(([A] + ([B] * 2)) - [C])");
    }

    #[test]
    fn parentheses_and_unary_minus() {
        let e = parse_expression("-([A] - [B]) / 4").unwrap();
        assert_eq!(
            e,
            Expr::Binary {
                op: BinaryOp::Div,
                lhs: Box::new(Expr::Neg(Box::new(Expr::Binary {
                    op: BinaryOp::Sub,
                    lhs: field("A"),
                    rhs: field("B"),
                }))),
                rhs: Box::new(Expr::Number(4.0)),
            }
        );
    }

    #[test]
    fn functions_and_labels_with_spaces() {
        let e = parse_expression("mean([Net Profit], 4) / SQRT([total assets])").unwrap();
        let refs: Vec<String> = e.references().into_iter().collect();
        assert_eq!(refs, vec!["Net Profit", "total assets"]);
    }

    #[test]
    fn scientific_notation() {
        assert_eq!(parse_expression("1.5e3").unwrap(), Expr::Number(1500.0));
        assert_eq!(
            parse_expression("2E-2 * [x]").unwrap().to_string(),
            "(0.02 * [x])"
        );
    }

    #[test]
    fn errors() {
        assert!(matches!(
            parse_expression("[A] +"),
            Err(ExprError::UnexpectedEnd)
        ));
        assert!(matches!(
            parse_expression("foo([A])"),
            Err(ExprError::UnknownFunction(_))
        ));
        assert!(matches!(
            parse_expression("pow([A])"),
            Err(ExprError::Arity { expected: 2, found: 1, .. })
        ));
        assert!(matches!(
            parse_expression("[A] [B]"),
            Err(ExprError::UnexpectedToken { .. })
        ));
        assert!(matches!(parse_expression("[A"), Err(ExprError::UnexpectedEnd)));
        assert!(matches!(
            parse_expression("[A] % 2"),
            Err(ExprError::UnexpectedToken { .. })
        ));
    }
}
