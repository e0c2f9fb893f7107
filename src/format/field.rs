//! ER-009: Fixed-width field codec for Fortran-style numbers.
//!
//! Floats are written in the compact ENDF exponent form (` 1.234567+5`:
//! no `E`, sign of the exponent directly after the mantissa) and read back
//! from that form as well as from ordinary decimal and `E` notation.

use crate::core::error::{EngineError, Result};
use crate::core::types::FormatOptions;
use crate::core::value::Number;

/// Expected type of a numeric field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Float,
    Int,
}

/// Text slice ⇄ number conversion for one field of the configured width.
pub trait FieldCodec: Send + Sync {
    fn width(&self) -> usize;
    fn decode(&self, text: &str, kind: FieldKind) -> Result<Number>;
    fn encode(&self, value: Number, kind: FieldKind) -> Result<String>;

    /// Terminator records are written with blank instead of zero fields.
    fn zero_as_blank(&self) -> bool {
        false
    }
}

/// The ENDF-6 field codec, driven by [`FormatOptions`].
#[derive(Debug, Clone, Default)]
pub struct FortranCodec {
    opts: FormatOptions,
}

impl FortranCodec {
    pub fn new(opts: FormatOptions) -> FortranCodec {
        FortranCodec { opts }
    }

    pub fn options(&self) -> &FormatOptions {
        &self.opts
    }

    fn decode_float(&self, text: &str) -> Result<f64> {
        if text.trim().is_empty() {
            return Ok(0.0);
        }
        let compact: String = if self.opts.accept_spaces {
            text.chars().filter(|c| *c != ' ').collect()
        } else {
            text.trim().to_string()
        };
        let mut normalized = String::with_capacity(compact.len() + 1);
        let mut prev: Option<char> = None;
        for c in compact.chars() {
            if (c == '+' || c == '-') && prev.is_some_and(|p| p.is_ascii_digit()) {
                normalized.push('E');
            }
            normalized.push(c);
            prev = Some(c);
        }
        normalized
            .parse::<f64>()
            .map_err(|_| EngineError::InvalidFloat(text.to_string()))
    }

    fn decode_int(&self, text: &str) -> Result<i64> {
        let t = text.trim();
        if t.is_empty() {
            return Ok(0);
        }
        t.parse::<i64>()
            .map_err(|_| EngineError::InvalidIntegerField(text.to_string()))
    }

    /// Exponent form: mantissa digits fill whatever the exponent leaves.
    fn exp_form(&self, val: f64) -> String {
        let width = self.opts.width;
        let av = val.abs();
        let nexp = if av == 0.0 || (1e-9..1e10).contains(&av) {
            1
        } else if (1e-99..1e100).contains(&av) {
            2
        } else {
            3
        };
        let is_pos = val >= 0.0;
        let sign_dec = usize::from(!(self.opts.abuse_signpos && is_pos));
        let expsymb_dec = usize::from(self.opts.keep_e);
        let mut exponent = if av == 0.0 { 0 } else { av.log10().floor() as i32 };
        let mut mantissa = scale(av, exponent);
        if mantissa >= 10.0 {
            exponent += 1;
            mantissa = scale(av, exponent);
        } else if av != 0.0 && mantissa < 1.0 {
            exponent -= 1;
            mantissa = scale(av, exponent);
        }
        let mantissa_len = width.saturating_sub(1 + nexp + sign_dec + expsymb_dec);
        let prec = mantissa_len.saturating_sub(2);
        let mantissa_str = format!("{:.*}", prec, mantissa);
        let sign = match (is_pos, self.opts.abuse_signpos) {
            (true, true) => "",
            (true, false) => " ",
            (false, _) => "-",
        };
        let expsign = if exponent >= 0 { '+' } else { '-' };
        let expsymb = if self.opts.keep_e { "E" } else { "" };
        let out = format!(
            "{}{}{}{}{:>nexp$}",
            sign,
            mantissa_str,
            expsymb,
            expsign,
            exponent.abs(),
            nexp = nexp
        );
        if out.len() > width {
            // 9.99..9 rounded up to 10.0..0; format the rounded value again
            let rounded = format!("{}{}e{}{}", sign.trim(), mantissa_str, expsign, exponent.abs());
            if let Ok(r) = rounded.parse::<f64>() {
                if r != val {
                    return self.exp_form(r);
                }
            }
        }
        out
    }

    /// Plain decimal form, as many fractional digits as fit.
    fn basic_form(&self, val: f64) -> String {
        let width = self.opts.width;
        let mut effwidth = width;
        let intpart = val.trunc();
        let is_integer = intpart == val;
        if is_integer && intpart == 0.0 {
            return format!("{:>width$}", "0", width = width);
        }
        let len_intpart = format!("{:.0}", intpart.abs()).len();
        let mut waste: i64 = 2;
        if self.opts.abuse_signpos && val > 0.0 {
            waste -= 1;
        }
        let skip_zero = self.opts.skip_intzero && intpart == 0.0;
        if skip_zero {
            effwidth += 1;
        }
        if is_integer {
            waste -= 1;
        }
        let floatwidth = effwidth as i64 - waste - len_intpart as i64;
        let mut s = if floatwidth > 0 && !is_integer {
            let mut s = format!("{:>w$.p$}", val, w = effwidth, p = floatwidth as usize);
            if skip_zero {
                if let Some(dot) = s.find('.') {
                    if dot > 0 {
                        s.remove(dot - 1);
                    }
                }
            }
            s
        } else {
            let mut s = format!("{:.0}", intpart);
            if val > 0.0 && !self.opts.abuse_signpos {
                s.insert(0, ' ');
            }
            if s.len() + 2 <= width {
                s.push('.');
                while s.len() < width {
                    s.push('0');
                }
            }
            s
        };
        if s.len() < width {
            s = format!("{:>width$}", s, width = width);
        }
        s
    }

    fn encode_float(&self, val: f64) -> Result<String> {
        if !val.is_finite() {
            return Err(EngineError::InvalidFloat(val.to_string()));
        }
        let exp = self.exp_form(val);
        if !self.opts.prefer_noexp {
            return Ok(exp);
        }
        let mut basic = self.basic_form(val);
        if basic.contains('.') {
            basic = basic.trim_end_matches('0').trim_end_matches('.').to_string();
            if matches!(basic.trim(), "" | "+" | "-") {
                basic = "0".to_string();
            }
        }
        if basic.len() > self.opts.width {
            return Ok(exp);
        }
        let delta_basic = (self.decode_float(&basic)? - val).abs();
        let delta_exp = (self.decode_float(&exp)? - val).abs();
        if delta_exp < delta_basic {
            return Ok(exp);
        }
        Ok(format!("{:>width$}", basic, width = self.opts.width))
    }

    fn encode_int(&self, value: Number) -> Result<String> {
        let v = match value {
            Number::Int(i) => i,
            Number::Float(f) => {
                if self.opts.strict_datatypes {
                    return Err(EngineError::InvalidInteger(format!(
                        "float {:?} in an integer field",
                        f
                    )));
                }
                value.as_exact_int().ok_or_else(|| {
                    EngineError::InvalidInteger(format!("{:?} in an integer field", f))
                })?
            }
        };
        let s = format!("{:>width$}", v, width = self.opts.width);
        if s.len() > self.opts.width {
            return Err(EngineError::SizeMismatch(format!(
                "integer {} does not fit into {} characters",
                v, self.opts.width
            )));
        }
        Ok(s)
    }
}

/// `av / 10^exponent` without going through a negative power.
fn scale(av: f64, exponent: i32) -> f64 {
    if exponent >= 0 {
        av / 10f64.powi(exponent)
    } else {
        av * 10f64.powi(-exponent)
    }
}

impl FieldCodec for FortranCodec {
    fn width(&self) -> usize {
        self.opts.width
    }

    fn decode(&self, text: &str, kind: FieldKind) -> Result<Number> {
        match kind {
            FieldKind::Float => self.decode_float(text).map(Number::Float),
            FieldKind::Int => self.decode_int(text).map(Number::Int),
        }
    }

    fn encode(&self, value: Number, kind: FieldKind) -> Result<String> {
        match kind {
            FieldKind::Float => self.encode_float(value.as_f64()),
            FieldKind::Int => self.encode_int(value),
        }
    }

    fn zero_as_blank(&self) -> bool {
        self.opts.zero_as_blank
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn codec() -> FortranCodec {
        FortranCodec::default()
    }

    fn enc(v: f64) -> String {
        codec().encode(Number::Float(v), FieldKind::Float).unwrap()
    }

    fn dec(s: &str) -> f64 {
        codec().decode(s, FieldKind::Float).unwrap().as_f64()
    }

    #[test]
    fn test_er009_float_exponent_form() {
        assert_eq!(enc(1.0), " 1.000000+0");
        assert_eq!(enc(0.0), " 0.000000+0");
        assert_eq!(enc(-2.5e-3), "-2.500000-3");
        assert_eq!(enc(1.23456789e12), " 1.23457+12");
        assert_eq!(enc(5.5e-120), " 5.5000-120");
        assert_eq!(enc(14.0), " 1.400000+1");
    }

    #[test]
    fn test_er009_mantissa_rounding_carry() {
        assert_eq!(enc(9.9999999999), " 1.000000+1");
        assert_eq!(enc(-9.9999999999), "-1.000000+1");
    }

    #[test]
    fn test_er009_float_decode_forms() {
        assert_eq!(dec(" 1.000000+0"), 1.0);
        assert_eq!(dec("-2.500000-3"), -2.5e-3);
        assert_eq!(dec(" 1.23457+12"), 1.23457e12);
        assert_eq!(dec("      2.5E3"), 2500.0);
        assert_eq!(dec("       -0.5"), -0.5);
        assert_eq!(dec("           "), 0.0);
        assert_eq!(dec(" 1.5 +  3  "), 1500.0);
    }

    #[test]
    fn test_er009_inner_spaces_rejected_when_disabled() {
        let c = FortranCodec::new(FormatOptions {
            accept_spaces: false,
            ..FormatOptions::default()
        });
        assert!(matches!(
            c.decode(" 1.5 + 3   ", FieldKind::Float),
            Err(EngineError::InvalidFloat(_))
        ));
    }

    #[test]
    fn test_er009_int_fields() {
        let c = codec();
        assert_eq!(c.decode("         42", FieldKind::Int).unwrap(), Number::Int(42));
        assert_eq!(c.decode("           ", FieldKind::Int).unwrap(), Number::Int(0));
        assert!(matches!(
            c.decode("        1.5", FieldKind::Int),
            Err(EngineError::InvalidIntegerField(_))
        ));
        assert_eq!(c.encode(Number::Int(-7), FieldKind::Int).unwrap(), "         -7");
        assert_eq!(c.encode(Number::Float(3.0), FieldKind::Int).unwrap(), "          3");
        assert!(c.encode(Number::Float(3.5), FieldKind::Int).is_err());
        assert!(c.encode(Number::Int(123456789012), FieldKind::Int).is_err());
    }

    #[test]
    fn test_er009_strict_datatypes() {
        let c = FortranCodec::new(FormatOptions {
            strict_datatypes: true,
            ..FormatOptions::default()
        });
        assert!(matches!(
            c.encode(Number::Float(3.0), FieldKind::Int),
            Err(EngineError::InvalidInteger(_))
        ));
    }

    #[test]
    fn test_er009_keep_e_and_signpos() {
        let c = FortranCodec::new(FormatOptions {
            keep_e: true,
            ..FormatOptions::default()
        });
        assert_eq!(c.encode(Number::Float(1.0), FieldKind::Float).unwrap(), " 1.00000E+0");
        let c = FortranCodec::new(FormatOptions {
            abuse_signpos: true,
            ..FormatOptions::default()
        });
        assert_eq!(c.encode(Number::Float(1.0), FieldKind::Float).unwrap(), "1.0000000+0");
        assert_eq!(c.encode(Number::Float(-1.0), FieldKind::Float).unwrap(), "-1.000000+0");
    }

    #[test]
    fn test_er009_prefer_noexp() {
        let c = FortranCodec::new(FormatOptions {
            prefer_noexp: true,
            ..FormatOptions::default()
        });
        let e = |v: f64| c.encode(Number::Float(v), FieldKind::Float).unwrap();
        assert_eq!(e(2.5), "        2.5");
        assert_eq!(e(0.0), "          0");
        assert_eq!(e(1234.5678), "  1234.5678");
        assert_eq!(e(1.0e-12), " 1.00000-12");
    }

    #[test]
    fn test_er009_non_finite_rejected() {
        assert!(codec().encode(Number::Float(f64::NAN), FieldKind::Float).is_err());
    }

    proptest! {
        #[test]
        fn prop_er009_float_round_trip_relative(m in 1.0f64..10.0, e in -30i32..30, neg in any::<bool>()) {
            let v = if neg { -m } else { m } * 10f64.powi(e);
            let s = enc(v);
            prop_assert_eq!(s.len(), 11);
            let back = dec(&s);
            prop_assert!((back - v).abs() <= 1e-5 * v.abs());
        }

        #[test]
        fn prop_er009_reencode_is_stable(m in 1.0f64..10.0, e in -9i32..10) {
            let s = enc(m * 10f64.powi(e));
            prop_assert_eq!(enc(dec(&s)), s);
        }

        #[test]
        fn prop_er009_int_round_trip(v in -999_999_999i64..9_999_999_999) {
            let c = codec();
            let s = c.encode(Number::Int(v), FieldKind::Int).unwrap();
            prop_assert_eq!(c.decode(&s, FieldKind::Int).unwrap(), Number::Int(v));
        }
    }
}
