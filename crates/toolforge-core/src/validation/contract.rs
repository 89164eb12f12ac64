//! Contract gate: declared entry-point types against the task's io hints.

use toolforge_store::ArtifactContract;

use crate::domain::{IoSpec, IoType, ValidationFault};

fn check_slot(
    slot: &str,
    expected: Option<&IoType>,
    declared: Option<&str>,
) -> Result<(), ValidationFault> {
    let Some(expected) = expected else {
        return Ok(());
    };
    if *expected == IoType::Any {
        return Ok(());
    }
    let mismatch = |declared: String| ValidationFault::Contract {
        expected: format!("{slot}: {expected}"),
        declared: format!("{slot}: {declared}"),
    };
    match declared {
        None => Err(mismatch("unannotated".to_string())),
        Some(text) => {
            let declared = IoType::parse(text);
            if expected.accepts(&declared) {
                Ok(())
            } else {
                Err(mismatch(declared.to_string()))
            }
        }
    }
}

/// Gate 4. Slots without a hint are not checked.
pub fn check(contract: &ArtifactContract, io: &IoSpec) -> Result<(), ValidationFault> {
    check_slot(
        "input",
        io.input_type.as_ref(),
        contract.input_type.as_deref(),
    )?;
    check_slot(
        "output",
        io.output_type.as_ref(),
        contract.output_type.as_deref(),
    )
}

/// Whether `next` can replace `prev` without breaking callers.
pub fn is_backward_compatible(prev: &ArtifactContract, next: &ArtifactContract) -> bool {
    let same = |a: &Option<String>, b: &Option<String>| match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => IoType::parse(a) == IoType::parse(b),
        _ => false,
    };
    prev.entry_point == next.entry_point
        && same(&prev.input_type, &next.input_type)
        && same(&prev.output_type, &next.output_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract(input: Option<&str>, output: Option<&str>) -> ArtifactContract {
        ArtifactContract {
            entry_point: "sum_list".into(),
            input_type: input.map(Into::into),
            output_type: output.map(Into::into),
        }
    }

    #[test]
    fn no_hints_always_pass() {
        assert!(check(&contract(None, None), &IoSpec::default()).is_ok());
    }

    #[test]
    fn matching_hints_pass() {
        let io = IoSpec::new(Some(IoType::List), Some(IoType::Number));
        assert!(check(&contract(Some("List[int]"), Some("int")), &io).is_ok());
    }

    #[test]
    fn mismatch_reports_expected_and_declared() {
        let io = IoSpec::new(Some(IoType::List), Some(IoType::Int));
        let err = check(&contract(Some("list"), Some("str")), &io).unwrap_err();
        assert_eq!(
            err,
            ValidationFault::Contract {
                expected: "output: int".into(),
                declared: "output: str".into(),
            }
        );
    }

    #[test]
    fn missing_annotation_fails_when_hinted() {
        let io = IoSpec::new(Some(IoType::List), None);
        assert!(matches!(
            check(&contract(None, Some("int")), &io),
            Err(ValidationFault::Contract { .. })
        ));
        let any = IoSpec::new(Some(IoType::Any), None);
        assert!(check(&contract(None, None), &any).is_ok());
    }

    #[test]
    fn compatibility_compares_parsed_types() {
        let a = contract(Some("list"), Some("int"));
        assert!(is_backward_compatible(&a, &contract(Some("List[int]"), Some("int"))));
        assert!(!is_backward_compatible(&a, &contract(Some("list"), Some("float"))));
        let mut renamed = a.clone();
        renamed.entry_point = "total".into();
        assert!(!is_backward_compatible(&a, &renamed));
    }
}
