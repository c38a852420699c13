//! Parser for einsum and permutation specs.
//!
//! The surface syntax: sections separated by `;` for the operands and `=>`
//! for the result; within a section, `|` separates batch axes from the rest
//! and `->` separates input axes from output axes. Axis labels are
//! whitespace/comma/paren separated tokens, or one character each when the
//! section contains no separator. A numeric token fixes the axis at that
//! index instead of iterating it.
//!
//! `"b|i->o; b|h->i => b|h->o"` composes two operands; `"i j => j i"` is a
//! permutation.

use std::collections::HashSet;

use nom::{
    bytes::complete::{tag, take_until},
    combinator::{opt, rest},
    multi::separated_list1,
    sequence::terminated,
    IResult,
};

use crate::error::Result;
use crate::{bail_shape, err_shape};

/// One axis label of a spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AxisLabel {
    /// A pseudo-label naming an iterated axis.
    Label(String),
    /// A fixed index into the axis.
    Fixed(i64),
}

/// The per-kind axis labels of one section.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AxesSpec {
    pub batch: Vec<AxisLabel>,
    pub input: Vec<AxisLabel>,
    pub output: Vec<AxisLabel>,
}

impl AxesSpec {
    /// Labels in physical axis order: batch, output, input.
    pub fn physical(&self) -> Vec<&AxisLabel> {
        self.batch.iter().chain(self.output.iter()).chain(self.input.iter()).collect()
    }

    fn label_set(&self) -> HashSet<&str> {
        self.physical()
            .into_iter()
            .filter_map(|l| match l {
                AxisLabel::Label(s) => Some(s.as_str()),
                AxisLabel::Fixed(_) => None,
            })
            .collect()
    }

    /// Input and output labels only. Batch labels are shared across every
    /// section rather than contracted, so they stay out of the
    /// symmetric-difference check.
    fn nonbatch_label_set(&self) -> HashSet<&str> {
        self.input
            .iter()
            .chain(self.output.iter())
            .filter_map(|l| match l {
                AxisLabel::Label(s) => Some(s.as_str()),
                AxisLabel::Fixed(_) => None,
            })
            .collect()
    }
}

/// A parsed einsum spec: the operand sections and the result section.
#[derive(Debug, Clone, PartialEq)]
pub struct EinsumSpec {
    pub operands: Vec<AxesSpec>,
    pub result: AxesSpec,
}

fn tokenize(axes: &str) -> Vec<AxisLabel> {
    let has_separator = axes.chars().any(|c| c.is_whitespace() || matches!(c, ',' | '(' | ')'));
    let to_label = |tok: &str| match tok.parse::<i64>() {
        Ok(i) => AxisLabel::Fixed(i),
        Err(_) => AxisLabel::Label(tok.to_string()),
    };
    if has_separator {
        axes.split(|c: char| c.is_whitespace() || matches!(c, ',' | '(' | ')'))
            .filter(|t| !t.is_empty())
            .map(to_label)
            .collect()
    } else {
        axes.trim().chars().map(|c| to_label(&c.to_string())).collect()
    }
}

/// `[batch |] [input ->] output`
fn section(input: &str) -> IResult<&str, AxesSpec> {
    let (rest_in, batch) = opt(terminated(take_until("|"), tag("|")))(input)?;
    let (rest_in, inp) = opt(terminated(take_until("->"), tag("->")))(rest_in)?;
    let (rest_in, out) = rest(rest_in)?;
    Ok((
        rest_in,
        AxesSpec {
            batch: batch.map(tokenize).unwrap_or_default(),
            input: inp.map(tokenize).unwrap_or_default(),
            output: tokenize(out),
        },
    ))
}

fn spec_sections(input: &str) -> IResult<&str, (Vec<&str>, &str)> {
    let (after, operands_text) = take_until("=>")(input)?;
    let (after, _) = tag("=>")(after)?;
    let (_, operands) = separated_list1(tag(";"), take_while_not_semi)(operands_text)?;
    Ok(("", (operands, after)))
}

fn take_while_not_semi(input: &str) -> IResult<&str, &str> {
    nom::bytes::complete::take_while(|c| c != ';')(input)
}

/// Parse a full einsum spec. The symmetric difference of the operand label
/// sets must equal the result's label set.
pub fn parse_einsum(spec: &str) -> Result<EinsumSpec> {
    let (_, (operand_texts, result_text)) =
        spec_sections(spec).map_err(|e| err_shape!("malformed einsum spec '{}': {}", spec, e))?;
    let mut operands = vec![];
    for text in operand_texts {
        let (_, axes) =
            section(text).map_err(|e| err_shape!("malformed einsum section '{}': {}", text, e))?;
        operands.push(axes);
    }
    let (_, result) = section(result_text)
        .map_err(|e| err_shape!("malformed einsum section '{}': {}", result_text, e))?;

    let mut sym_diff: HashSet<&str> = HashSet::new();
    for op in &operands {
        for label in op.nonbatch_label_set() {
            if !sym_diff.remove(label) {
                sym_diff.insert(label);
            }
        }
    }
    let result_set = result.nonbatch_label_set();
    if sym_diff != result_set {
        bail_shape!(
            "einsum '{}': result labels {:?} do not match the symmetric difference {:?} of operand labels",
            spec,
            {
                let mut v: Vec<_> = result_set.into_iter().collect();
                v.sort_unstable();
                v
            },
            {
                let mut v: Vec<_> = sym_diff.into_iter().collect();
                v.sort_unstable();
                v
            }
        );
    }
    Ok(EinsumSpec { operands, result })
}

/// Parse a permutation spec: exactly one operand section.
pub fn parse_permutation(spec: &str) -> Result<(AxesSpec, AxesSpec)> {
    let parsed = parse_permutation_lax(spec)?;
    let source_set = parsed.0.label_set();
    let result_set = parsed.1.label_set();
    if source_set != result_set {
        bail_shape!("permutation '{}' drops or invents axis labels", spec);
    }
    Ok(parsed)
}

fn parse_permutation_lax(spec: &str) -> Result<(AxesSpec, AxesSpec)> {
    let (_, (operand_texts, result_text)) =
        spec_sections(spec).map_err(|e| err_shape!("malformed permutation spec '{}': {}", spec, e))?;
    if operand_texts.len() != 1 {
        bail_shape!("permutation '{}' must have exactly one operand section", spec);
    }
    let (_, source) = section(operand_texts[0])
        .map_err(|e| err_shape!("malformed permutation section '{}': {}", operand_texts[0], e))?;
    let (_, result) = section(result_text)
        .map_err(|e| err_shape!("malformed permutation section '{}': {}", result_text, e))?;
    Ok((source, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<AxisLabel> {
        names.iter().map(|n| AxisLabel::Label(n.to_string())).collect()
    }

    #[test]
    fn parses_compose_spec() {
        let spec = parse_einsum("b|i->o; b|h->i => b|h->o").unwrap();
        assert_eq!(spec.operands.len(), 2);
        assert_eq!(spec.operands[0].batch, labels(&["b"]));
        assert_eq!(spec.operands[0].input, labels(&["i"]));
        assert_eq!(spec.operands[0].output, labels(&["o"]));
        assert_eq!(spec.result.input, labels(&["h"]));
    }

    #[test]
    fn per_character_labels_without_separator() {
        let spec = parse_einsum("ij;jk=>ik").unwrap();
        assert_eq!(spec.operands[0].output, labels(&["i", "j"]));
        assert_eq!(spec.operands[1].output, labels(&["j", "k"]));
        assert_eq!(spec.result.output, labels(&["i", "k"]));
    }

    #[test]
    fn numeric_token_is_fixed_index() {
        let spec = parse_einsum("b 0 c => b c").unwrap();
        assert_eq!(spec.operands[0].output[1], AxisLabel::Fixed(0));
    }

    #[test]
    fn label_set_mismatch_is_rejected() {
        assert!(parse_einsum("ij;jk=>iq").is_err());
    }

    #[test]
    fn missing_arrow_means_no_input_axes() {
        let spec = parse_einsum("b|o => b|o").unwrap();
        assert!(spec.operands[0].input.is_empty());
        assert_eq!(spec.operands[0].batch, labels(&["b"]));
        assert_eq!(spec.operands[0].output, labels(&["o"]));
    }

    #[test]
    fn permutation_round_trip() {
        let (src, dst) = parse_permutation("i j => j i").unwrap();
        assert_eq!(src.output, labels(&["i", "j"]));
        assert_eq!(dst.output, labels(&["j", "i"]));
    }

    #[test]
    fn permutation_label_mismatch_is_rejected() {
        assert!(parse_permutation("i j => j q").is_err());
    }
}
