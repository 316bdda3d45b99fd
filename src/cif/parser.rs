//! Tokenizer and block builder for CIF text.

use super::{Category, CifFile, Column, DataBlock, ParseError};
use crate::model::Presence;

type ParseResult<T> = std::result::Result<T, ParseError>;

#[derive(Debug, Clone, PartialEq)]
enum Token<'t> {
    Data(&'t str),
    Loop,
    Name(&'t str),
    Value(&'t str, Presence),
}

struct Tokenizer<'t> {
    text: &'t str,
    bytes: &'t [u8],
    pos: usize,
    line: usize,
}

impl<'t> Tokenizer<'t> {
    fn new(text: &'t str) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    fn at_line_start(&self) -> bool {
        self.pos == 0 || self.bytes[self.pos - 1] == b'\n'
    }

    fn skip_whitespace_and_comments(&mut self) {
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                b' ' | b'\t' | b'\r' => self.pos += 1,
                b'#' => {
                    while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn next_token(&mut self) -> ParseResult<Option<Token<'t>>> {
        self.skip_whitespace_and_comments();
        if self.pos >= self.bytes.len() {
            return Ok(None);
        }

        let c = self.bytes[self.pos];
        if c == b';' && self.at_line_start() {
            return self.text_field().map(Some);
        }
        if c == b'\'' || c == b'"' {
            return self.quoted(c).map(Some);
        }

        let start = self.pos;
        while self.pos < self.bytes.len() && !self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        let word = &self.text[start..self.pos];
        self.classify(word).map(Some)
    }

    fn classify(&self, word: &'t str) -> ParseResult<Token<'t>> {
        if word.starts_with('_') {
            return Ok(Token::Name(&word[1..]));
        }

        let lower = word.get(..5).map(|p| p.to_ascii_lowercase());
        match lower.as_deref() {
            Some("data_") => return Ok(Token::Data(&word[5..])),
            Some("loop_") if word.len() == 5 => return Ok(Token::Loop),
            Some("save_") => {
                return Err(ParseError::new(self.line, "save frames are not supported"))
            }
            Some("stop_") => return Err(ParseError::new(self.line, "stop_ is not supported")),
            _ => {}
        }
        if word.eq_ignore_ascii_case("global_") {
            return Err(ParseError::new(self.line, "global_ blocks are not supported"));
        }

        Ok(match word {
            "." => Token::Value("", Presence::NotSpecified),
            "?" => Token::Value("", Presence::Unknown),
            _ => Token::Value(word, Presence::Present),
        })
    }

    fn quoted(&mut self, quote: u8) -> ParseResult<Token<'t>> {
        let start = self.pos + 1;
        let mut i = start;
        while i < self.bytes.len() {
            let b = self.bytes[i];
            if b == b'\n' {
                break;
            }
            if b == quote {
                let next = self.bytes.get(i + 1);
                if next.map_or(true, |n| n.is_ascii_whitespace()) {
                    self.pos = i + 1;
                    return Ok(Token::Value(&self.text[start..i], Presence::Present));
                }
            }
            i += 1;
        }
        Err(ParseError::new(self.line, "unterminated quoted value"))
    }

    fn text_field(&mut self) -> ParseResult<Token<'t>> {
        let start = self.pos + 1;
        let start_line = self.line;
        match self.text[start..].find("\n;") {
            Some(offset) => {
                let end = start + offset;
                let value = &self.text[start..end];
                self.line += value.matches('\n').count() + 1;
                self.pos = end + 2;
                Ok(Token::Value(value.strip_suffix('\r').unwrap_or(value), Presence::Present))
            }
            None => Err(ParseError::new(start_line, "unterminated text field")),
        }
    }
}

/// Parse CIF text into its data blocks.
pub fn parse(text: &str) -> ParseResult<CifFile> {
    let mut tokens = Tokenizer::new(text);
    let mut file = CifFile::default();
    let mut pending: Option<Token> = None;

    loop {
        let token = match pending.take() {
            Some(t) => t,
            None => match tokens.next_token()? {
                Some(t) => t,
                None => break,
            },
        };

        match token {
            Token::Data(header) => file.blocks.push(DataBlock::new(header)),
            Token::Loop => {
                let block = current_block(&mut file, tokens.line)?;
                pending = parse_loop(&mut tokens, block)?;
            }
            Token::Name(name) => {
                let line = tokens.line;
                let block = current_block(&mut file, line)?;
                let value = match tokens.next_token()? {
                    Some(Token::Value(v, p)) => (v, p),
                    _ => {
                        return Err(ParseError::new(line, format!("item _{} has no value", name)))
                    }
                };
                add_item(block, name, value, line)?;
            }
            Token::Value(..) => {
                return Err(ParseError::new(tokens.line, "value without an item name"));
            }
        }
    }

    Ok(file)
}

fn current_block(file: &mut CifFile, line: usize) -> ParseResult<&mut DataBlock> {
    file.blocks
        .last_mut()
        .ok_or_else(|| ParseError::new(line, "content before the first data_ block"))
}

fn split_name(name: &str, line: usize) -> ParseResult<(&str, &str)> {
    name.split_once('.')
        .filter(|(cat, field)| !cat.is_empty() && !field.is_empty())
        .ok_or_else(|| ParseError::new(line, format!("item _{} is not of the form _category.field", name)))
}

fn add_item(block: &mut DataBlock, name: &str, value: (&str, Presence), line: usize) -> ParseResult<()> {
    let (cat, field) = split_name(name, line)?;

    if block.category_mut(cat).is_none() {
        block.push_category(Category {
            name: cat.to_string(),
            row_count: 1,
            columns: Vec::new(),
            from_loop: false,
        });
    }
    let category = block
        .category_mut(cat)
        .ok_or_else(|| ParseError::new(line, "category vanished"))?;

    if category.from_loop {
        return Err(ParseError::new(line, format!("category {} is already defined by a loop", cat)));
    }
    if category.column(field).is_some() {
        return Err(ParseError::new(line, format!("item _{} is defined twice", name)));
    }

    let mut column = Column::new(field);
    column.push(value.0, value.1);
    category.columns.push(column);
    Ok(())
}

/// Reads a `loop_` table. Returns the first token that is not part of it.
fn parse_loop<'t>(tokens: &mut Tokenizer<'t>, block: &mut DataBlock) -> ParseResult<Option<Token<'t>>> {
    let line = tokens.line;
    let mut category_name: Option<&str> = None;
    let mut columns: Vec<Column> = Vec::new();

    let mut next = tokens.next_token()?;
    while let Some(Token::Name(name)) = next {
        let (cat, field) = split_name(name, tokens.line)?;
        match category_name {
            None => category_name = Some(cat),
            Some(c) if c != cat => {
                return Err(ParseError::new(
                    tokens.line,
                    format!("loop mixes categories {} and {}", c, cat),
                ))
            }
            _ => {}
        }
        columns.push(Column::new(field));
        next = tokens.next_token()?;
    }

    let Some(cat) = category_name else {
        return Err(ParseError::new(line, "loop_ without item names"));
    };

    let mut count = 0usize;
    while let Some(Token::Value(value, presence)) = next {
        let width = columns.len();
        columns[count % width].push(value, presence);
        count += 1;
        next = tokens.next_token()?;
    }

    if count % columns.len() != 0 {
        return Err(ParseError::new(
            line,
            format!(
                "loop for {} has {} values, not a multiple of its {} columns",
                cat,
                count,
                columns.len()
            ),
        ));
    }
    if block.category(cat).is_some() {
        return Err(ParseError::new(line, format!("category {} is defined twice", cat)));
    }

    block.push_category(Category {
        name: cat.to_string(),
        row_count: count / columns.len(),
        columns,
        from_loop: true,
    });

    Ok(next)
}
