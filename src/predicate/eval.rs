//! 三值谓词求值
//!
//! 引用的字段未赋值且无默认值时结果为 Indeterminate；提问与执行只在 True 时发生。
//! 字段的取值只有在该字段自身谓词为 True 时才可见，跨字段引用成环由深度上限拦截。

use tracing::warn;

use crate::core::PredicateError;
use crate::predicate::parser::{Builtin, CmpOp, Expr, FieldRef, Literal};
use crate::predicate::Predicate;
use crate::state::{DialogueState, FieldValue, TaskRecord};
use crate::template::TemplateRegistry;

/// 字段谓词嵌套求值的深度上限
const MAX_DEPTH: usize = 16;

/// 三值逻辑
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Indeterminate,
}

impl Truth {
    pub fn is_true(self) -> bool {
        self == Truth::True
    }

    fn from_bool(b: bool) -> Self {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }

    fn not(self) -> Self {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Indeterminate => Truth::Indeterminate,
        }
    }
}

/// 求值得到的操作数
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Value(FieldValue),
    Null,
    /// 引用了未赋值的字段
    Unknown,
}

/// 求值上下文：当前记录（可能是动作执行中的草稿记录）+ 整个对话状态
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub registry: &'a TemplateRegistry,
    pub state: &'a DialogueState,
    pub record: Option<&'a TaskRecord>,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        registry: &'a TemplateRegistry,
        state: &'a DialogueState,
        record: Option<&'a TaskRecord>,
    ) -> Self {
        Self {
            registry,
            state,
            record,
        }
    }

    pub fn truth(&self, predicate: &Predicate) -> Result<Truth, PredicateError> {
        self.truth_of(predicate.expr(), 0)
    }

    /// 求值失败记录告警并视为 False
    pub fn check(&self, predicate: &Predicate, owner: &str) -> Truth {
        match self.truth(predicate) {
            Ok(t) => t,
            Err(e) => {
                warn!(owner, predicate = predicate.source(), error = %e, "predicate evaluation failed");
                Truth::False
            }
        }
    }

    /// 表达式取值；引用未赋值字段或 none 时返回 None
    pub fn value(&self, expr: &Expr) -> Result<Option<FieldValue>, PredicateError> {
        match self.operand(expr, 0)? {
            Operand::Value(v) => Ok(Some(v)),
            Operand::Null | Operand::Unknown => Ok(None),
        }
    }

    /// 字段在当前记录上是否处于激活状态（其谓词为 True）
    pub fn field_active(&self, record: &TaskRecord, field: &str) -> Result<bool, PredicateError> {
        let scoped = EvalContext {
            record: Some(record),
            ..*self
        };
        let template = self
            .registry
            .get(&record.template)
            .ok_or_else(|| PredicateError::UnknownField(format!("{}.{field}", record.template)))?;
        let ft = template
            .field(field)
            .ok_or_else(|| PredicateError::UnknownField(format!("{}.{field}", record.template)))?;
        Ok(scoped.truth_of(ft.predicate.expr(), 1)?.is_true())
    }

    fn truth_of(&self, expr: &Expr, depth: usize) -> Result<Truth, PredicateError> {
        match expr {
            Expr::Not(inner) => Ok(self.truth_of(inner, depth)?.not()),
            Expr::And(a, b) => {
                let left = self.truth_of(a, depth)?;
                if left == Truth::False {
                    return Ok(Truth::False);
                }
                match (left, self.truth_of(b, depth)?) {
                    (_, Truth::False) => Ok(Truth::False),
                    (Truth::True, Truth::True) => Ok(Truth::True),
                    _ => Ok(Truth::Indeterminate),
                }
            }
            Expr::Or(a, b) => {
                let left = self.truth_of(a, depth)?;
                if left == Truth::True {
                    return Ok(Truth::True);
                }
                match (left, self.truth_of(b, depth)?) {
                    (_, Truth::True) => Ok(Truth::True),
                    (Truth::False, Truth::False) => Ok(Truth::False),
                    _ => Ok(Truth::Indeterminate),
                }
            }
            Expr::Compare(a, op, b) => {
                let left = self.operand(a, depth)?;
                let right = self.operand(b, depth)?;
                if left == Operand::Unknown || right == Operand::Unknown {
                    return Ok(Truth::Indeterminate);
                }
                compare(&left, *op, &right).map(Truth::from_bool)
            }
            Expr::Call(builtin, r) => {
                let (record, set) = match self.lookup_raw(r, depth)? {
                    Some((record, value)) => (Some(record), value.is_some()),
                    None => (None, false),
                };
                Ok(Truth::from_bool(match builtin {
                    Builtin::IsSet => set,
                    Builtin::IsUnset => !set,
                    Builtin::Confirmed => record.is_some_and(|rec| rec.confirmed.contains(&r.field)),
                }))
            }
            other => match self.operand(other, depth)? {
                Operand::Value(FieldValue::Bool(b)) => Ok(Truth::from_bool(b)),
                Operand::Value(v) => Err(PredicateError::NotBoolean(v.type_name().to_string())),
                Operand::Null => Ok(Truth::False),
                Operand::Unknown => Ok(Truth::Indeterminate),
            },
        }
    }

    fn operand(&self, expr: &Expr, depth: usize) -> Result<Operand, PredicateError> {
        match expr {
            Expr::Literal(Literal::Value(v)) => Ok(Operand::Value(v.clone())),
            Expr::Literal(Literal::Null) => Ok(Operand::Null),
            Expr::Ref(r) => self.lookup(r, depth),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match self.operand(item, depth)? {
                        Operand::Value(v) => values.push(v),
                        Operand::Null => {}
                        Operand::Unknown => return Ok(Operand::Unknown),
                    }
                }
                Ok(Operand::Value(FieldValue::List(values)))
            }
            logical => Ok(match self.truth_of(logical, depth)? {
                Truth::True => Operand::Value(FieldValue::Bool(true)),
                Truth::False => Operand::Value(FieldValue::Bool(false)),
                Truth::Indeterminate => Operand::Unknown,
            }),
        }
    }

    /// 定位引用所在记录并取其原始值（不含默认值）；记录不存在时返回 None
    fn lookup_raw(
        &self,
        r: &FieldRef,
        depth: usize,
    ) -> Result<Option<(&'a TaskRecord, Option<FieldValue>)>, PredicateError> {
        let record = match &r.worksheet {
            Some(ws) => match self.record.filter(|rec| &rec.template == ws) {
                Some(rec) => Some(rec),
                None => self.state.find_active(ws),
            },
            None => self.record,
        };
        let Some(record) = record else {
            return Ok(None);
        };
        let template = self
            .registry
            .get(&record.template)
            .ok_or_else(|| PredicateError::UnknownField(r.to_string()))?;
        let field = template
            .field(&r.field)
            .ok_or_else(|| PredicateError::UnknownField(r.to_string()))?;
        if depth >= MAX_DEPTH {
            return Err(PredicateError::Cycle(r.to_string()));
        }
        let scoped = EvalContext {
            record: Some(record),
            ..*self
        };
        if !scoped.truth_of(field.predicate.expr(), depth + 1)?.is_true() {
            return Ok(Some((record, None)));
        }
        Ok(Some((record, record.value(&r.field).cloned())))
    }

    fn lookup(&self, r: &FieldRef, depth: usize) -> Result<Operand, PredicateError> {
        let Some((record, value)) = self.lookup_raw(r, depth)? else {
            return Ok(Operand::Unknown);
        };
        if let Some(v) = value {
            return Ok(Operand::Value(v));
        }
        let default = self
            .registry
            .get(&record.template)
            .and_then(|t| t.field(&r.field))
            .and_then(|f| f.default.clone());
        Ok(default.map(Operand::Value).unwrap_or(Operand::Unknown))
    }
}

fn values_equal(a: &FieldValue, b: &FieldValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => match (a.as_text(), b.as_text()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
    }
}

fn compare(left: &Operand, op: CmpOp, right: &Operand) -> Result<bool, PredicateError> {
    let mismatch = |l: &str, r: &str| PredicateError::TypeMismatch {
        op: op.symbol().to_string(),
        left: l.to_string(),
        right: r.to_string(),
    };
    let (l, r) = match (left, right) {
        (Operand::Value(l), Operand::Value(r)) => (l, r),
        _ => {
            let both_null = left == &Operand::Null && right == &Operand::Null;
            return match op {
                CmpOp::Eq => Ok(both_null),
                CmpOp::Ne => Ok(!both_null),
                CmpOp::In | CmpOp::NotIn => Ok(op == CmpOp::NotIn),
                _ => Err(mismatch("none", "none")),
            };
        }
    };
    match op {
        CmpOp::Eq => Ok(values_equal(l, r)),
        CmpOp::Ne => Ok(!values_equal(l, r)),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (l.as_f64(), r.as_f64(), l.as_text(), r.as_text()) {
                (Some(x), Some(y), _, _) => x.partial_cmp(&y),
                (_, _, Some(x), Some(y)) => Some(x.cmp(y)),
                _ => None,
            }
            .ok_or_else(|| mismatch(l.type_name(), r.type_name()))?;
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
        CmpOp::In | CmpOp::NotIn => {
            let found = match (r, l.as_text(), r.as_text()) {
                (FieldValue::List(items), _, _) => items.iter().any(|i| values_equal(l, i)),
                (_, Some(needle), Some(hay)) => hay.contains(needle),
                _ => return Err(mismatch(l.type_name(), r.type_name())),
            };
            Ok(found == (op == CmpOp::In))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Initiator;
    use crate::template::{FieldBuilder, FieldType, WorksheetBuilder};

    fn registry() -> TemplateRegistry {
        let mut registry = TemplateRegistry::new();
        registry
            .register(
                WorksheetBuilder::task("Book")
                    .field(FieldBuilder::new("people", FieldType::Int))
                    .field(FieldBuilder::new("kids", FieldType::Int).predicate("people > 2"))
                    .field(
                        FieldBuilder::new("seating", FieldType::String)
                            .default_value(FieldValue::String("indoor".into())),
                    )
                    .field(FieldBuilder::new("loop_a", FieldType::Int).predicate("loop_b > 0"))
                    .field(FieldBuilder::new("loop_b", FieldType::Int).predicate("loop_a > 0"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    fn record(registry: &TemplateRegistry) -> TaskRecord {
        TaskRecord::new(registry.get("Book").unwrap(), Initiator::User)
    }

    fn eval(registry: &TemplateRegistry, rec: &TaskRecord, src: &str) -> Result<Truth, PredicateError> {
        let state = DialogueState::new();
        let p = Predicate::parse(src).unwrap();
        EvalContext::new(registry, &state, Some(rec)).truth(&p)
    }

    #[test]
    fn test_unset_field_is_indeterminate() {
        let registry = registry();
        let rec = record(&registry);
        assert_eq!(eval(&registry, &rec, "people > 2").unwrap(), Truth::Indeterminate);
        assert_eq!(eval(&registry, &rec, "is_set(people)").unwrap(), Truth::False);
    }

    #[test]
    fn test_three_valued_connectives() {
        let registry = registry();
        let mut rec = record(&registry);
        rec.values.insert("people".into(), FieldValue::Int(4));
        assert_eq!(eval(&registry, &rec, "people > 2 and kids > 0").unwrap(), Truth::Indeterminate);
        assert_eq!(eval(&registry, &rec, "people < 2 and kids > 0").unwrap(), Truth::False);
        assert_eq!(eval(&registry, &rec, "people > 2 or kids > 0").unwrap(), Truth::True);
        assert_eq!(eval(&registry, &rec, "not (kids > 0)").unwrap(), Truth::Indeterminate);
    }

    #[test]
    fn test_inactive_field_is_invisible() {
        let registry = registry();
        let mut rec = record(&registry);
        rec.values.insert("people".into(), FieldValue::Int(2));
        rec.values.insert("kids".into(), FieldValue::Int(1));
        // kids 的谓词 people > 2 为 False
        assert_eq!(eval(&registry, &rec, "is_set(kids)").unwrap(), Truth::False);
    }

    #[test]
    fn test_default_value_is_used() {
        let registry = registry();
        let rec = record(&registry);
        assert_eq!(eval(&registry, &rec, "seating == 'indoor'").unwrap(), Truth::True);
    }

    #[test]
    fn test_membership() {
        let registry = registry();
        let mut rec = record(&registry);
        rec.values.insert("people".into(), FieldValue::Int(3));
        assert_eq!(eval(&registry, &rec, "people in [1, 2, 3]").unwrap(), Truth::True);
        assert_eq!(eval(&registry, &rec, "people not in [1, 2, 3]").unwrap(), Truth::False);
        assert_eq!(eval(&registry, &rec, "'door' in seating").unwrap(), Truth::True);
    }

    #[test]
    fn test_ordering_type_mismatch_is_error() {
        let registry = registry();
        let mut rec = record(&registry);
        rec.values.insert("people".into(), FieldValue::Int(3));
        assert!(matches!(
            eval(&registry, &rec, "people < 'abc'"),
            Err(PredicateError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_predicate_cycle_is_detected() {
        let registry = registry();
        let mut rec = record(&registry);
        rec.values.insert("loop_a".into(), FieldValue::Int(1));
        assert!(matches!(
            eval(&registry, &rec, "loop_a > 0"),
            Err(PredicateError::Cycle(_))
        ));
    }

    #[test]
    fn test_non_boolean_predicate_is_error() {
        let registry = registry();
        let mut rec = record(&registry);
        rec.values.insert("people".into(), FieldValue::Int(3));
        assert!(matches!(
            eval(&registry, &rec, "people"),
            Err(PredicateError::NotBoolean(_))
        ));
    }

    #[test]
    fn test_qualified_reference_reads_stack() {
        let registry = registry();
        let mut state = DialogueState::new();
        let mut rec = record(&registry);
        rec.values.insert("people".into(), FieldValue::Int(5));
        state.focus_stack.push(rec);
        let p = Predicate::parse("Book.people >= 5").unwrap();
        let ctx = EvalContext::new(&registry, &state, None);
        assert_eq!(ctx.truth(&p).unwrap(), Truth::True);
    }
}
