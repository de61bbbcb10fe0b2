// ============================================================
// Layer 3 — SMILES Grammar Checker
// ============================================================
// A structural SMILES parser used as the default validity
// collaborator. It accepts a string when it is well formed:
//
//   • organic-subset atoms   B C N O P S F Cl Br I * b c n o p s
//   • bracket atoms          [13CH3+], [nH], [C@@H], [Fe+2], [NH4+:1]
//   • bonds                  - = # $ : / \
//   • branches               ( ... ), balanced, never empty,
//                            always attached to a preceding atom
//   • ring closures          0-9 and %nn, every one opened is closed,
//                            a bond symbol on either end is allowed
//   • components             separated by '.', none empty
//
// It does NOT perceive valence or aromaticity, so "C(C)(C)(C)(C)C"
// passes here although no chemistry toolkit would accept it.
//
// Canonicalisation returns the trimmed input of a valid string,
// optionally with stereo marks (@, /, \) removed.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

use crate::domain::traits::ValidityChecker;

/// Body of a bracket atom, without the surrounding brackets.
///   isotope? symbol chirality? hcount? charge? class?
const BRACKET_ATOM_PATTERN: &str = concat!(
    r"^(?P<isotope>[0-9]+)?",
    r"(?P<symbol>\*|[A-Z][a-z]?|se|as|te|b|c|n|o|p|s)",
    r"(?P<chiral>@(?:@|TH[12]|AL[12]|SP[1-3]|TB[0-9]{1,2}|OH[0-9]{1,2})?)?",
    r"(?P<hcount>H[0-9]?)?",
    r"(?P<charge>[+-](?:[+-]|[0-9]{1,2})?)?",
    r"(?P<class>:[0-9]+)?$",
);

fn bracket_atom_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(BRACKET_ATOM_PATTERN).ok()).as_ref()
}

// ─── Parse errors ─────────────────────────────────────────────────────────────
/// Why a string was rejected. Only used for debug logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmilesSyntaxError {
    Empty,
    UnexpectedChar { pos: usize, ch: char },
    BadBracketAtom { pos: usize, body: String },
    UnclosedBracket { pos: usize },
    DanglingBond { pos: usize },
    EmptyBranch { pos: usize },
    UnbalancedBranch { pos: usize },
    RingBondWithoutAtom { pos: usize },
    UnclosedRing { label: u16 },
    ConflictingRingBond { label: u16 },
    EmptyComponent { pos: usize },
}

// ─── SmilesGrammar ────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, Default)]
pub struct SmilesGrammar;

impl SmilesGrammar {
    pub fn new() -> Self {
        Self
    }

    /// Full structural parse. Returns the number of atoms on success.
    pub fn parse(&self, smiles: &str) -> Result<usize, SmilesSyntaxError> {
        Parser::new(smiles.trim()).run()
    }

    /// Canonical form with or without stereo marks.
    pub fn canonicalize_with(&self, smiles: &str, include_stereocenters: bool) -> Option<String> {
        let trimmed = smiles.trim();
        self.parse(trimmed).ok()?;
        if include_stereocenters {
            Some(trimmed.to_string())
        } else {
            Some(strip_stereo(trimmed))
        }
    }
}

impl ValidityChecker for SmilesGrammar {
    fn is_valid(&self, smiles: &str) -> bool {
        match self.parse(smiles) {
            Ok(atoms) => atoms > 0,
            Err(e) => {
                tracing::trace!("Rejected SMILES {:?}: {:?}", smiles, e);
                false
            }
        }
    }

    fn canonicalize(&self, smiles: &str) -> Option<String> {
        self.canonicalize_with(smiles, true)
    }
}

/// Canonicalise every string, drop the invalid ones and remove
/// duplicates while keeping first-seen order.
pub fn canonicalize_list<C, I, S>(checker: &C, smiles: I) -> Vec<String>
where
    C: ValidityChecker + ?Sized,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    smiles
        .into_iter()
        .filter_map(|s| checker.canonicalize(s.as_ref()))
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

/// Fraction of strings the checker accepts. Zero for an empty input.
pub fn validity_fraction<C, S>(checker: &C, smiles: &[S]) -> f64
where
    C: ValidityChecker + ?Sized,
    S: AsRef<str>,
{
    if smiles.is_empty() {
        return 0.0;
    }
    let valid = smiles.iter().filter(|s| checker.is_valid(s.as_ref())).count();
    valid as f64 / smiles.len() as f64
}

fn strip_stereo(smiles: &str) -> String {
    let mut out = String::with_capacity(smiles.len());
    let mut in_bracket = false;
    let mut chars = smiles.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '[' => {
                in_bracket = true;
                out.push(c);
            }
            ']' => {
                in_bracket = false;
                out.push(c);
            }
            '/' | '\\' if !in_bracket => {}
            '@' if in_bracket => {
                // Drop the whole chirality tag, e.g. @@, @TH1, @SP2
                while let Some(&n) = chars.peek() {
                    if n == '@' || n.is_ascii_digit() || matches!(n, 'T' | 'A' | 'S' | 'O' | 'B' | 'P' | 'L') {
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

// ─── Parser state machine ─────────────────────────────────────────────────────
struct Parser {
    chars:        Vec<char>,
    pos:          usize,
    atoms:        usize,
    /// An atom exists in the current chain that bonds / branches / rings attach to
    has_prev:     bool,
    /// A bond symbol was read and still waits for its atom
    pending_bond: Option<(usize, char)>,
    /// Positions of open '(' with whether the branch has seen an atom yet
    branches:     Vec<(usize, bool)>,
    /// Open ring labels with the bond symbol written at the opening end
    rings:        HashMap<u16, Option<char>>,
    /// Atoms since the last '.'
    component_atoms: usize,
}

impl Parser {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            atoms: 0,
            has_prev: false,
            pending_bond: None,
            branches: Vec::new(),
            rings: HashMap::new(),
            component_atoms: 0,
        }
    }

    fn run(mut self) -> Result<usize, SmilesSyntaxError> {
        if self.chars.is_empty() {
            return Err(SmilesSyntaxError::Empty);
        }

        while self.pos < self.chars.len() {
            let c = self.chars[self.pos];
            match c {
                '[' => self.bracket_atom()?,
                'B' | 'C' | 'N' | 'O' | 'P' | 'S' | 'F' | 'I' | '*'
                | 'b' | 'c' | 'n' | 'o' | 'p' | 's' => self.organic_atom(),
                '-' | '=' | '#' | '$' | ':' | '/' | '\\' => {
                    if !self.has_prev || self.pending_bond.is_some() {
                        return Err(SmilesSyntaxError::DanglingBond { pos: self.pos });
                    }
                    self.pending_bond = Some((self.pos, c));
                    self.pos += 1;
                }
                '0'..='9' => {
                    let label = (c as u8 - b'0') as u16;
                    self.pos += 1;
                    self.ring_bond(label)?;
                }
                '%' => {
                    let digits: String = self.chars
                        .get(self.pos + 1..self.pos + 3)
                        .map(|d| d.iter().collect())
                        .unwrap_or_default();
                    if digits.len() != 2 || !digits.chars().all(|d| d.is_ascii_digit()) {
                        return Err(SmilesSyntaxError::UnexpectedChar { pos: self.pos, ch: c });
                    }
                    let label = digits.parse::<u16>().map_err(|_| {
                        SmilesSyntaxError::UnexpectedChar { pos: self.pos, ch: c }
                    })?;
                    self.pos += 3;
                    self.ring_bond(label)?;
                }
                '(' => {
                    if !self.has_prev || self.pending_bond.is_some() {
                        return Err(SmilesSyntaxError::UnbalancedBranch { pos: self.pos });
                    }
                    self.branches.push((self.pos, false));
                    self.pos += 1;
                }
                ')' => {
                    if let Some((pos, _)) = self.pending_bond {
                        return Err(SmilesSyntaxError::DanglingBond { pos });
                    }
                    match self.branches.pop() {
                        Some((_, true)) => {}
                        Some((open, false)) => {
                            return Err(SmilesSyntaxError::EmptyBranch { pos: open })
                        }
                        None => return Err(SmilesSyntaxError::UnbalancedBranch { pos: self.pos }),
                    }
                    // Back on the parent atom, which still exists
                    self.has_prev = true;
                    self.pos += 1;
                }
                '.' => {
                    if let Some((pos, _)) = self.pending_bond {
                        return Err(SmilesSyntaxError::DanglingBond { pos });
                    }
                    if self.component_atoms == 0 || !self.branches.is_empty() {
                        return Err(SmilesSyntaxError::EmptyComponent { pos: self.pos });
                    }
                    self.has_prev = false;
                    self.component_atoms = 0;
                    self.pos += 1;
                }
                other => {
                    return Err(SmilesSyntaxError::UnexpectedChar { pos: self.pos, ch: other })
                }
            }
        }

        if let Some((pos, _)) = self.pending_bond {
            return Err(SmilesSyntaxError::DanglingBond { pos });
        }
        if let Some(&(pos, _)) = self.branches.last() {
            return Err(SmilesSyntaxError::UnbalancedBranch { pos });
        }
        if let Some(&label) = self.rings.keys().min() {
            return Err(SmilesSyntaxError::UnclosedRing { label });
        }
        if self.component_atoms == 0 {
            return Err(SmilesSyntaxError::EmptyComponent { pos: self.pos });
        }
        Ok(self.atoms)
    }

    fn organic_atom(&mut self) {
        let c = self.chars[self.pos];
        let next = self.chars.get(self.pos + 1).copied();
        let width = match (c, next) {
            ('C', Some('l')) | ('B', Some('r')) => 2,
            _ => 1,
        };
        self.pos += width;
        self.push_atom();
    }

    fn bracket_atom(&mut self) -> Result<(), SmilesSyntaxError> {
        let open = self.pos;
        let close = self.chars[open..]
            .iter()
            .position(|&c| c == ']')
            .map(|offset| open + offset)
            .ok_or(SmilesSyntaxError::UnclosedBracket { pos: open })?;

        let body: String = self.chars[open + 1..close].iter().collect();
        if !bracket_atom_regex().is_some_and(|re| re.is_match(&body)) {
            return Err(SmilesSyntaxError::BadBracketAtom { pos: open, body });
        }
        self.pos = close + 1;
        self.push_atom();
        Ok(())
    }

    fn push_atom(&mut self) {
        self.atoms += 1;
        self.component_atoms += 1;
        self.has_prev = true;
        self.pending_bond = None;
        if let Some(top) = self.branches.last_mut() {
            top.1 = true;
        }
    }

    fn ring_bond(&mut self, label: u16) -> Result<(), SmilesSyntaxError> {
        if !self.has_prev {
            return Err(SmilesSyntaxError::RingBondWithoutAtom { pos: self.pos });
        }
        let bond = self.pending_bond.take().map(|(_, b)| b);
        match self.rings.remove(&label) {
            None => {
                self.rings.insert(label, bond);
            }
            Some(opening) => {
                // Both ends may carry a bond symbol only if they agree
                if let (Some(a), Some(b)) = (opening, bond) {
                    let directional = |x: char| x == '/' || x == '\\';
                    if a != b && !(directional(a) && directional(b)) {
                        return Err(SmilesSyntaxError::ConflictingRingBond { label });
                    }
                }
            }
        }
        Ok(())
    }
}
