//! Default-on-absence policy.
//!
//! Every read of an absent field during formula evaluation goes through
//! [`read_absent`]; nothing else in the evaluator special-cases `null`.
//!
//! | Declared type         | Nullable | Read of an absent value |
//! |-----------------------|----------|-------------------------|
//! | boolean               | any      | `false`                 |
//! | string / enumeration  | no       | `""`                    |
//! | string / enumeration  | yes      | stays absent            |
//! | integer               | any      | stays absent            |

use crate::rulebook::DataType;
use crate::value::Value;

/// What an absent value reads as for a field of the given declaration.
pub fn read_absent(datatype: DataType, nullable: bool) -> Value {
    match datatype {
        DataType::Boolean => Value::Bool(false),
        DataType::String | DataType::Enumeration if !nullable => Value::text(""),
        DataType::String | DataType::Enumeration => Value::Absent,
        DataType::Integer => Value::Absent,
    }
}

/// Apply the policy to a stored value. Present values pass through.
pub fn read(value: &Value, datatype: DataType, nullable: bool) -> Value {
    if value.is_absent() {
        read_absent(datatype, nullable)
    } else {
        value.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_table() {
        assert_eq!(read_absent(DataType::Boolean, false), Value::Bool(false));
        assert_eq!(read_absent(DataType::Boolean, true), Value::Bool(false));
        assert_eq!(read_absent(DataType::String, false), Value::text(""));
        assert_eq!(read_absent(DataType::String, true), Value::Absent);
        assert_eq!(read_absent(DataType::Enumeration, false), Value::text(""));
        assert_eq!(read_absent(DataType::Enumeration, true), Value::Absent);
        assert_eq!(read_absent(DataType::Integer, false), Value::Absent);
        assert_eq!(read_absent(DataType::Integer, true), Value::Absent);
    }

    #[test]
    fn present_values_pass_through() {
        assert_eq!(
            read(&Value::Bool(true), DataType::Boolean, false),
            Value::Bool(true)
        );
        assert_eq!(
            read(&Value::text("x"), DataType::String, true),
            Value::text("x")
        );
    }
}
