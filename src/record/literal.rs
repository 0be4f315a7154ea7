//! Literal parsing
//!
//! Parses type names and typed value literals as they appear in index
//! queries and on the command line.
//!
//! ```text
//! int64  array[string]  map[string,int64]  record[a:int64,b:ip]
//! 336  -7  3.5  true  "quoted \"str\""  bare-str  10.0.0.1
//! 1587508851.06466032  2020-04-21T22:40:50Z  1.5s  250ms  42
//! ```

use crate::error::{ZarError, ZarResult};
use crate::record::types::{Column, Type, TypeContext};
use crate::record::value::Value;
use crate::span::Ts;
use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, tag, take_while1},
    character::complete::{char, digit1, none_of},
    combinator::{all_consuming, map, map_opt, map_res, opt, recognize, value},
    multi::separated_list0,
    number::complete::double,
    sequence::{delimited, pair, preceded, separated_pair},
    IResult,
};
use std::net::IpAddr;
use std::sync::Arc;

/// Parse a type name such as `int64` or `array[string]`.
pub fn parse_type(zctx: &TypeContext, input: &str) -> ZarResult<Type> {
    match all_consuming(type_expr)(input.trim()) {
        Ok((_, ty)) => {
            if let Type::Record(cols) = &ty {
                return zctx.lookup_record(cols.to_vec());
            }
            Ok(zctx.canonical(&ty))
        }
        Err(_) => Err(ZarError::Validation(format!("unknown type \"{}\"", input))),
    }
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.')(input)
}

fn column(input: &str) -> IResult<&str, Column> {
    map(separated_pair(identifier, char(':'), type_expr), |(name, ty)| {
        Column::new(name, ty)
    })(input)
}

fn type_expr(input: &str) -> IResult<&str, Type> {
    alt((
        map(delimited(tag("array["), type_expr, char(']')), |t| {
            Type::Array(Arc::new(t))
        }),
        map(delimited(tag("set["), type_expr, char(']')), |t| {
            Type::Set(Arc::new(t))
        }),
        map(
            delimited(
                tag("map["),
                separated_pair(type_expr, char(','), type_expr),
                char(']'),
            ),
            |(k, v)| Type::Map(Arc::new((k, v))),
        ),
        map(
            delimited(tag("record["), separated_list0(char(','), column), char(']')),
            |cols| Type::Record(cols.into()),
        ),
        map_opt(identifier, Type::from_primitive_name),
    ))(input)
}

/// Parse a literal of type `ty`. `null` parses as null for every type.
pub fn parse_value(ty: &Type, input: &str) -> ZarResult<Value> {
    let s = input.trim();
    if s == "null" {
        return Ok(Value::Null);
    }
    let invalid = || ZarError::Validation(format!("invalid {} literal \"{}\"", ty, input));
    let parsed = match ty.underlying() {
        Type::Int32 | Type::Int64 => all_consuming(map_res(signed, str::parse::<i64>))(s)
            .map(|(_, v)| Value::Int(v)),
        Type::Uint64 => {
            all_consuming(map_res(digit1, str::parse::<u64>))(s).map(|(_, v)| Value::Uint(v))
        }
        Type::Float64 => all_consuming(double)(s).map(|(_, v)| Value::Float(v)),
        Type::Bool => all_consuming(alt((value(true, tag("true")), value(false, tag("false")))))(
            s,
        )
        .map(|(_, v)| Value::Bool(v)),
        Type::String => all_consuming(alt((quoted, map(take_while1(|_| true), String::from))))(s)
            .map(|(_, v)| Value::String(v)),
        Type::Time => return parse_time(s).map(Value::Time).ok_or_else(invalid),
        Type::Duration => all_consuming(duration)(s).map(|(_, v)| Value::Duration(v)),
        Type::Ip => return s.parse::<IpAddr>().map(Value::Ip).map_err(|_| invalid()),
        Type::Enum(symbols) => {
            return symbols
                .iter()
                .position(|sym| sym == s)
                .map(|idx| Value::Enum(idx as u64))
                .ok_or_else(invalid)
        }
        other => {
            return Err(ZarError::Validation(format!(
                "literals of type {} are not supported",
                other
            )))
        }
    };
    parsed.map_err(|_: nom::Err<nom::error::Error<&str>>| invalid())
}

fn signed(input: &str) -> IResult<&str, &str> {
    recognize(pair(opt(char('-')), digit1))(input)
}

fn quoted(input: &str) -> IResult<&str, String> {
    map(
        delimited(
            char('"'),
            opt(escaped_transform(
                none_of("\\\""),
                '\\',
                alt((
                    value("\\", tag("\\")),
                    value("\"", tag("\"")),
                    value("\n", tag("n")),
                    value("\t", tag("t")),
                )),
            )),
            char('"'),
        ),
        Option::unwrap_or_default,
    )(input)
}

fn duration(input: &str) -> IResult<&str, i64> {
    alt((
        map(
            pair(
                double,
                alt((
                    value(1.0, tag("ns")),
                    value(1e3, tag("us")),
                    value(1e6, tag("ms")),
                    value(1e9, tag("s")),
                    value(60e9, tag("m")),
                    value(3600e9, tag("h")),
                    value(86400e9, tag("d")),
                )),
            ),
            |(n, unit)| (n * unit) as i64,
        ),
        map_res(signed, str::parse::<i64>),
    ))(input)
}

/// Decimal seconds with an optional fraction, or RFC3339.
pub fn parse_time(s: &str) -> Option<Ts> {
    let seconds = all_consuming(pair(signed, opt(preceded(char('.'), digit1))))(s);
    if let Ok((_, (secs, frac))) = seconds {
        let secs: i64 = secs.parse().ok()?;
        let mut nanos: i64 = 0;
        if let Some(frac) = frac {
            let digits: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
            nanos = digits.parse().ok()?;
        }
        let nanos = if secs < 0 || s.starts_with('-') {
            -nanos
        } else {
            nanos
        };
        return secs.checked_mul(1_000_000_000)?.checked_add(nanos);
    }
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()?
        .timestamp_nanos_opt()
}
