//! Deterministic flag evaluation: disabled state, individual targets, rule
//! conditions (including segment membership) and percentage rollout.

use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use crate::types::{
    Condition, EvalDetail, FeatureFlag, FlagState, FlagType, RolloutDispatch, RolloutVariation,
    Segment, cast_variation,
};
use crate::user::User;

pub const REASON_CLIENT_NOT_READY: &str = "client not ready";
pub const REASON_FLAG_NOT_FOUND: &str = "flag not found";
pub const REASON_ERROR: &str = "error in evaluation";
pub const REASON_USER_NOT_SPECIFIED: &str = "user not specified";
pub const REASON_WRONG_TYPE: &str = "wrong type";
pub const REASON_FLAG_OFF: &str = "flag off";
pub const REASON_TARGET_MATCH: &str = "target match";
pub const REASON_RULE_MATCH: &str = "rule match";
pub const REASON_FALLTHROUGH: &str = "fall through all rules";

/// Sentinel variation id for failed evaluations.
pub const NO_VARIATION: &str = "NE";

const FLAG_KEY_UNKNOWN: &str = "flag key unknown";
const FLAG_NAME_UNKNOWN: &str = "flag name unknown";

const THAN_CLAUSE: &str = "Than";
const GE_CLAUSE: &str = "BiggerEqualThan";
const GT_CLAUSE: &str = "BiggerThan";
const LE_CLAUSE: &str = "LessEqualThan";
const LT_CLAUSE: &str = "LessThan";
const EQ_CLAUSE: &str = "Equal";
const NEQ_CLAUSE: &str = "NotEqual";
const CONTAINS_CLAUSE: &str = "Contains";
const NOT_CONTAIN_CLAUSE: &str = "NotContain";
const IS_ONE_OF_CLAUSE: &str = "IsOneOf";
const NOT_ONE_OF_CLAUSE: &str = "NotOneOf";
const STARTS_WITH_CLAUSE: &str = "StartsWith";
const ENDS_WITH_CLAUSE: &str = "EndsWith";
const IS_TRUE_CLAUSE: &str = "IsTrue";
const IS_FALSE_CLAUSE: &str = "IsFalse";
const MATCH_REGEX_CLAUSE: &str = "MatchRegex";
const NOT_MATCH_REGEX_CLAUSE: &str = "NotMatchRegex";
const IS_IN_SEGMENT_CLAUSE: &str = "User is in segment";
const NOT_IN_SEGMENT_CLAUSE: &str = "User is not in segment";

const EXPT_KEY_PREFIX: &str = "expt";

const DEFAULT_DISPATCH_KEY: &str = "keyid";

/// Raw outcome of one evaluation, before type conversion.
#[derive(Debug, Clone)]
pub struct EvalResult {
    /// Variation id, or [`NO_VARIATION`] on error.
    pub variation_id: String,
    /// Stored string value; the default value on error.
    pub value: Option<String>,
    pub reason: &'static str,
    pub send_to_experiment: bool,
    pub key_name: String,
    pub flag_name: String,
    pub flag_type: FlagType,
}

impl EvalResult {
    pub fn error(
        default_value: Option<String>,
        reason: &'static str,
        key_name: &str,
        flag_type: FlagType,
    ) -> Self {
        Self {
            variation_id: NO_VARIATION.to_string(),
            value: default_value,
            reason,
            send_to_experiment: false,
            key_name: if key_name.is_empty() {
                FLAG_KEY_UNKNOWN.to_string()
            } else {
                key_name.to_string()
            },
            flag_name: FLAG_NAME_UNKNOWN.to_string(),
            flag_type,
        }
    }

    pub fn is_success(&self) -> bool {
        self.variation_id != NO_VARIATION
    }

    pub fn eval_detail(&self) -> EvalDetail {
        EvalDetail {
            reason: self.reason.to_string(),
            variation: cast_variation(self.flag_type, self.value.as_deref()),
            key_name: self.key_name.clone(),
            name: self.flag_name.clone(),
        }
    }

    pub fn flag_state(&self) -> FlagState {
        FlagState {
            success: self.is_success(),
            message: if self.is_success() {
                "OK".to_string()
            } else {
                self.reason.to_string()
            },
            data: self.eval_detail(),
        }
    }
}

pub type FlagGetter = Arc<dyn Fn(&str) -> Option<Arc<FeatureFlag>> + Send + Sync>;
pub type SegmentGetter = Arc<dyn Fn(&str) -> Option<Arc<Segment>> + Send + Sync>;

/// The decision pipeline. The evaluator only sees getter functions, so it is
/// agnostic to the store implementation behind them.
pub struct Evaluator {
    flag_getter: FlagGetter,
    segment_getter: SegmentGetter,
}

impl Evaluator {
    pub fn new(flag_getter: FlagGetter, segment_getter: SegmentGetter) -> Self {
        Self {
            flag_getter,
            segment_getter,
        }
    }

    pub fn get_flag(&self, key: &str) -> Option<Arc<FeatureFlag>> {
        (self.flag_getter)(key)
    }

    /// Evaluate `flag` for `user`. First match wins: disabled state,
    /// individual targets, rules in order, then the fallthrough rollout.
    pub fn evaluate(&self, flag: &FeatureFlag, user: &User) -> EvalResult {
        let result = self
            .disabled_variation(flag)
            .or_else(|| self.targeted_variation(flag, user))
            .or_else(|| self.rule_variation(flag, user))
            .or_else(|| self.rollout_variation(flag, &flag.fallthrough, user, REASON_FALLTHROUGH))
            .unwrap_or_else(|| {
                EvalResult::error(None, REASON_ERROR, &flag.key, flag.variation_type)
            });
        debug!(
            user = user.key(),
            flag = %result.key_name,
            value = result.value.as_deref().unwrap_or(""),
            reason = result.reason,
            "flag evaluated"
        );
        result
    }

    fn disabled_variation(&self, flag: &FeatureFlag) -> Option<EvalResult> {
        if flag.is_enabled {
            return None;
        }
        Some(self.variation_result(flag, &flag.disabled_variation_id, REASON_FLAG_OFF, false))
    }

    fn targeted_variation(&self, flag: &FeatureFlag, user: &User) -> Option<EvalResult> {
        for target in &flag.target_users {
            if target.key_ids.iter().any(|key| key == user.key()) {
                return Some(self.variation_result(
                    flag,
                    &target.variation_id,
                    REASON_TARGET_MATCH,
                    flag.expt_include_all_targets,
                ));
            }
        }
        None
    }

    fn rule_variation(&self, flag: &FeatureFlag, user: &User) -> Option<EvalResult> {
        for rule in &flag.rules {
            if self.match_all_conditions(user, &rule.conditions) {
                return self.rollout_variation(flag, &rule.dispatch, user, REASON_RULE_MATCH);
            }
        }
        None
    }

    fn variation_result(
        &self,
        flag: &FeatureFlag,
        variation_id: &str,
        reason: &'static str,
        send_to_experiment: bool,
    ) -> EvalResult {
        match flag.variation_value(variation_id) {
            Some(value) => EvalResult {
                variation_id: variation_id.to_string(),
                value: Some(value.to_string()),
                reason,
                send_to_experiment,
                key_name: flag.key.clone(),
                flag_name: flag.name.clone(),
                flag_type: flag.variation_type,
            },
            None => EvalResult::error(None, REASON_ERROR, &flag.key, flag.variation_type),
        }
    }

    fn rollout_variation(
        &self,
        flag: &FeatureFlag,
        dispatch: &RolloutDispatch,
        user: &User,
        reason: &'static str,
    ) -> Option<EvalResult> {
        let dispatch_key = dispatch
            .dispatch_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .unwrap_or(DEFAULT_DISPATCH_KEY);
        let dispatch_key_value =
            format!("{}{}", flag.key, user.get(dispatch_key).unwrap_or_default());
        for variation in &dispatch.variations {
            if key_in_rollout(&dispatch_key_value, variation.rollout) {
                let send_to_experiment = send_to_experiment(
                    &dispatch_key_value,
                    variation,
                    flag.expt_include_all_targets,
                    dispatch.included_in_expt,
                );
                return Some(self.variation_result(
                    flag,
                    &variation.id,
                    reason,
                    send_to_experiment,
                ));
            }
        }
        None
    }

    fn match_all_conditions(&self, user: &User, conditions: &[Condition]) -> bool {
        conditions
            .iter()
            .all(|condition| self.match_condition(user, condition))
    }

    fn match_condition(&self, user: &User, condition: &Condition) -> bool {
        // Legacy segment conditions carry the operator in `property`.
        let op = condition
            .op
            .as_deref()
            .filter(|op| !op.is_empty())
            .unwrap_or(&condition.property);
        if op.contains(THAN_CLAUSE) {
            return match_numeric(user, condition, op);
        }
        match op {
            EQ_CLAUSE => match_equals(user, condition),
            NEQ_CLAUSE => !match_equals(user, condition),
            CONTAINS_CLAUSE => match_contains(user, condition),
            NOT_CONTAIN_CLAUSE => !match_contains(user, condition),
            IS_ONE_OF_CLAUSE => match_one_of(user, condition),
            NOT_ONE_OF_CLAUSE => !match_one_of(user, condition),
            STARTS_WITH_CLAUSE => match_starts_with(user, condition),
            ENDS_WITH_CLAUSE => match_ends_with(user, condition),
            IS_TRUE_CLAUSE => match_bool_literal(user, condition, "true"),
            IS_FALSE_CLAUSE => match_bool_literal(user, condition, "false"),
            MATCH_REGEX_CLAUSE => match_regex(user, condition),
            NOT_MATCH_REGEX_CLAUSE => !match_regex(user, condition),
            IS_IN_SEGMENT_CLAUSE => self.in_segment(user, condition),
            NOT_IN_SEGMENT_CLAUSE => !self.in_segment(user, condition),
            _ => false,
        }
    }

    fn in_segment(&self, user: &User, condition: &Condition) -> bool {
        let Some(value) = condition.value.as_deref() else {
            return false;
        };
        let Ok(segment_ids) = serde_json::from_str::<Vec<String>>(value) else {
            return false;
        };
        segment_ids.iter().any(|id| {
            (self.segment_getter)(id)
                .is_some_and(|segment| self.match_segment(user, &segment))
        })
    }

    fn match_segment(&self, user: &User, segment: &Segment) -> bool {
        let key = user.key();
        if segment.excluded.contains(key) {
            return false;
        }
        if segment.included.contains(key) {
            return true;
        }
        segment
            .rules
            .iter()
            .any(|rule| self.match_all_conditions(user, &rule.conditions))
    }
}

fn attribute<'a>(user: &'a User, condition: &Condition) -> Option<&'a str> {
    user.get(&condition.property)
}

fn match_numeric(user: &User, condition: &Condition, op: &str) -> bool {
    let Some(pv) = attribute(user, condition).and_then(|v| v.parse::<f64>().ok()) else {
        return false;
    };
    let Some(cv) = condition
        .value
        .as_deref()
        .and_then(|v| v.parse::<f64>().ok())
    else {
        return false;
    };
    let (pv, cv) = (round5(pv), round5(cv));
    match op {
        GE_CLAUSE => pv >= cv,
        GT_CLAUSE => pv > cv,
        LE_CLAUSE => pv <= cv,
        LT_CLAUSE => pv < cv,
        _ => false,
    }
}

fn round5(value: f64) -> f64 {
    (value * 100_000.0).round() / 100_000.0
}

fn match_equals(user: &User, condition: &Condition) -> bool {
    match (attribute(user, condition), condition.value.as_deref()) {
        (Some(pv), Some(cv)) => pv == cv,
        _ => false,
    }
}

fn match_contains(user: &User, condition: &Condition) -> bool {
    match (attribute(user, condition), condition.value.as_deref()) {
        (Some(pv), Some(cv)) => pv.contains(cv),
        _ => false,
    }
}

fn match_one_of(user: &User, condition: &Condition) -> bool {
    let Some(pv) = attribute(user, condition) else {
        return false;
    };
    condition
        .value
        .as_deref()
        .and_then(|v| serde_json::from_str::<Vec<String>>(v).ok())
        .is_some_and(|values| values.iter().any(|value| value == pv))
}

fn match_starts_with(user: &User, condition: &Condition) -> bool {
    match (attribute(user, condition), condition.value.as_deref()) {
        (Some(pv), Some(cv)) => pv.starts_with(cv),
        _ => false,
    }
}

fn match_ends_with(user: &User, condition: &Condition) -> bool {
    match (attribute(user, condition), condition.value.as_deref()) {
        (Some(pv), Some(cv)) => pv.ends_with(cv),
        _ => false,
    }
}

fn match_bool_literal(user: &User, condition: &Condition, literal: &str) -> bool {
    attribute(user, condition).is_some_and(|pv| pv.eq_ignore_ascii_case(literal))
}

fn match_regex(user: &User, condition: &Condition) -> bool {
    match (attribute(user, condition), condition.value.as_deref()) {
        (Some(pv), Some(cv)) => Regex::new(cv).map(|re| re.is_match(pv)).unwrap_or(false),
        _ => false,
    }
}

/// Bucket position of a key in `[0, 1)`: the first four MD5 bytes read as a
/// little-endian signed 32-bit integer, normalized by `|i32::MIN|`.
pub(crate) fn percentage_of_key(key: &str) -> f64 {
    let digest = md5::compute(key.as_bytes());
    let magic = i32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (f64::from(magic) / f64::from(i32::MIN)).abs()
}

/// Whether a key falls inside a rollout interval. `[0, 1]` always matches.
pub(crate) fn key_in_rollout(key: &str, range: [f64; 2]) -> bool {
    if range[0] == 0.0 && range[1] == 1.0 {
        return true;
    }
    let percentage = percentage_of_key(key);
    percentage >= range[0] && percentage < range[1]
}

fn send_to_experiment(
    dispatch_key_value: &str,
    variation: &RolloutVariation,
    expt_include_all_targets: bool,
    included_in_expt: bool,
) -> bool {
    if expt_include_all_targets {
        return true;
    }
    if !included_in_expt {
        return false;
    }
    let send_percentage = variation.expt_rollout;
    let splitting_percentage = variation.rollout[1] - variation.rollout[0];
    if send_percentage == 0.0 || splitting_percentage == 0.0 {
        return false;
    }
    let upper_bound = (send_percentage / splitting_percentage).min(1.0);
    key_in_rollout(
        &format!("{EXPT_KEY_PREFIX}{dispatch_key_value}"),
        [0.0, upper_bound],
    )
}

/// Whether any rule of `flag` names `segment_id` in a segment condition.
/// Used to synthesize flag-change notices when a segment changes.
pub(crate) fn flag_references_segment(flag: &FeatureFlag, segment_id: &str) -> bool {
    flag.rules
        .iter()
        .flat_map(|rule| &rule.conditions)
        .any(|condition| {
            let op = condition
                .op
                .as_deref()
                .filter(|op| !op.is_empty())
                .unwrap_or(&condition.property);
            if op != IS_IN_SEGMENT_CLAUSE && op != NOT_IN_SEGMENT_CLAUSE {
                return false;
            }
            condition
                .value
                .as_deref()
                .and_then(|v| serde_json::from_str::<Vec<String>>(v).ok())
                .is_some_and(|ids| ids.iter().any(|id| id == segment_id))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FlagRule, MatchRule, TargetUsers, Variation};
    use std::collections::HashMap;

    fn user(key: &str) -> User {
        User::builder(key).name(key).build().unwrap()
    }

    fn condition(property: &str, op: &str, value: &str) -> Condition {
        Condition {
            property: property.to_string(),
            op: Some(op.to_string()),
            value: Some(value.to_string()),
        }
    }

    fn full_rollout(id: &str) -> RolloutDispatch {
        RolloutDispatch {
            dispatch_key: None,
            included_in_expt: false,
            variations: vec![RolloutVariation {
                id: id.to_string(),
                rollout: [0.0, 1.0],
                expt_rollout: 1.0,
            }],
        }
    }

    fn bool_flag() -> FeatureFlag {
        let mut flag = FeatureFlag {
            id: "srv-ff-test-bool".to_string(),
            key: "ff-test-bool".to_string(),
            name: "test bool flag".to_string(),
            variation_type: FlagType::Boolean,
            is_enabled: true,
            variations: vec![
                Variation {
                    id: "v-true".to_string(),
                    value: "true".to_string(),
                },
                Variation {
                    id: "v-false".to_string(),
                    value: "false".to_string(),
                },
            ],
            disabled_variation_id: "v-false".to_string(),
            target_users: vec![TargetUsers {
                variation_id: "v-true".to_string(),
                key_ids: vec!["test-target-user".to_string()],
            }],
            rules: vec![FlagRule {
                conditions: vec![condition("country", "Equal", "us")],
                dispatch: full_rollout("v-true"),
            }],
            fallthrough: full_rollout("v-false"),
            expt_include_all_targets: false,
            variation_map: HashMap::new(),
        };
        flag.build_variation_map();
        flag
    }

    fn evaluator() -> Evaluator {
        evaluator_with_segments(HashMap::new())
    }

    fn evaluator_with_segments(segments: HashMap<String, Arc<Segment>>) -> Evaluator {
        Evaluator::new(
            Arc::new(|_: &str| None),
            Arc::new(move |id: &str| segments.get(id).cloned()),
        )
    }

    #[test]
    fn test_disabled_flag_returns_disabled_variation() {
        let mut flag = bool_flag();
        flag.is_enabled = false;
        let result = evaluator().evaluate(&flag, &user("anyone"));
        assert_eq!(result.reason, REASON_FLAG_OFF);
        assert_eq!(result.value.as_deref(), Some("false"));
        assert!(!result.send_to_experiment);
        assert!(result.is_success());
    }

    #[test]
    fn test_target_match_wins_over_rules() {
        let flag = bool_flag();
        let result = evaluator().evaluate(&flag, &user("test-target-user"));
        assert_eq!(result.reason, REASON_TARGET_MATCH);
        assert_eq!(result.value.as_deref(), Some("true"));
    }

    #[test]
    fn test_rule_match_and_fallthrough() {
        let flag = bool_flag();
        let us_user = User::builder("u-1")
            .name("u-1")
            .custom("country", "us")
            .build()
            .unwrap();
        let result = evaluator().evaluate(&flag, &us_user);
        assert_eq!(result.reason, REASON_RULE_MATCH);
        assert_eq!(result.value.as_deref(), Some("true"));

        let result = evaluator().evaluate(&flag, &user("test-fallthrough-user"));
        assert_eq!(result.reason, REASON_FALLTHROUGH);
        assert_eq!(result.value.as_deref(), Some("false"));
    }

    #[test]
    fn test_missing_variation_id_is_an_error() {
        let mut flag = bool_flag();
        flag.disabled_variation_id = "v-missing".to_string();
        flag.is_enabled = false;
        let result = evaluator().evaluate(&flag, &user("anyone"));
        assert_eq!(result.reason, REASON_ERROR);
        assert!(!result.is_success());
        assert_eq!(result.variation_id, NO_VARIATION);
    }

    fn check(op: &str, attr: (&str, &str), value: &str) -> bool {
        let u = User::builder("u-1")
            .name("u-1")
            .custom(attr.0, attr.1)
            .build()
            .unwrap();
        evaluator().match_condition(&u, &condition(attr.0, op, value))
    }

    #[test]
    fn test_numeric_operators_round_to_five_decimals() {
        assert!(check("BiggerThan", ("salary", "2500"), "2000"));
        assert!(!check("BiggerThan", ("salary", "2000"), "2000"));
        assert!(check("BiggerEqualThan", ("salary", "2000"), "2000"));
        assert!(check("LessThan", ("salary", "1999.5"), "2000"));
        assert!(check("LessEqualThan", ("salary", "2000"), "2000"));
        // 5-decimal rounding makes these equal.
        assert!(check("BiggerEqualThan", ("ratio", "0.1000001"), "0.1000004"));
        assert!(!check("BiggerThan", ("ratio", "0.1000001"), "0.1000004"));
        // Non-numeric operands never match.
        assert!(!check("BiggerThan", ("salary", "high"), "2000"));
        assert!(!check("BiggerThan", ("salary", "2500"), "low"));
    }

    #[test]
    fn test_string_operators() {
        assert!(check("Equal", ("country", "CHN"), "CHN"));
        assert!(!check("Equal", ("country", "CHN"), "chn"));
        assert!(check("NotEqual", ("country", "CHN"), "chn"));
        assert!(check("Contains", ("email", "a@gmail.com"), "@gmail"));
        assert!(check("NotContain", ("email", "a@corp.com"), "@gmail"));
        assert!(check("StartsWith", ("keyid", "group-admin-x"), "group-admin"));
        assert!(check("EndsWith", ("email", "a@gmail.com"), ".com"));
    }

    #[test]
    fn test_missing_attribute_never_matches() {
        let u = user("u-1");
        let eval = evaluator();
        assert!(!eval.match_condition(&u, &condition("country", "Equal", "us")));
        // NotEqual is the negation, so a missing attribute matches it.
        assert!(eval.match_condition(&u, &condition("country", "NotEqual", "us")));
    }

    #[test]
    fn test_set_operators() {
        assert!(check("IsOneOf", ("major", "CS"), r#"["CS", "Math"]"#));
        assert!(!check("IsOneOf", ("major", "Art"), r#"["CS", "Math"]"#));
        assert!(check("NotOneOf", ("major", "Art"), r#"["CS", "Math"]"#));
        // Malformed JSON never matches.
        assert!(!check("IsOneOf", ("major", "CS"), "CS, Math"));
    }

    #[test]
    fn test_bool_operators_are_case_insensitive() {
        assert!(check("IsTrue", ("graduated", "true"), ""));
        assert!(check("IsTrue", ("graduated", "True"), ""));
        assert!(!check("IsTrue", ("graduated", "false"), ""));
        assert!(check("IsFalse", ("graduated", "FALSE"), ""));
    }

    #[test]
    fn test_regex_operators() {
        assert!(check("MatchRegex", ("phone", "18555358000"), r"^1\d{10}$"));
        assert!(!check("MatchRegex", ("phone", "0603111111"), r"^1\d{10}$"));
        assert!(check("NotMatchRegex", ("phone", "0603111111"), r"^1\d{10}$"));
        // An unanchored pattern searches anywhere in the value.
        assert!(check("MatchRegex", ("email", "x@featbit.io"), "featbit"));
        // Invalid patterns never match.
        assert!(!check("MatchRegex", ("phone", "123"), "("));
    }

    #[test]
    fn test_unknown_operator_never_matches() {
        assert!(!check("SomethingElse", ("country", "us"), "us"));
    }

    fn segment_fixture() -> HashMap<String, Arc<Segment>> {
        let mut segments = HashMap::new();
        segments.insert(
            "seg-1".to_string(),
            Arc::new(Segment {
                included: ["seg-user-in".to_string()].into(),
                excluded: ["seg-user-out".to_string()].into(),
                rules: vec![MatchRule {
                    conditions: vec![condition("country", "Equal", "jp")],
                }],
            }),
        );
        segments
    }

    #[test]
    fn test_segment_membership() {
        let eval = evaluator_with_segments(segment_fixture());
        let in_condition = condition("", IS_IN_SEGMENT_CLAUSE, r#"["seg-1"]"#);

        assert!(eval.match_condition(&user("seg-user-in"), &in_condition));
        // Excluded wins even when a rule would match.
        let excluded = User::builder("seg-user-out")
            .name("n")
            .custom("country", "jp")
            .build()
            .unwrap();
        assert!(!eval.match_condition(&excluded, &in_condition));
        // Rule-based membership.
        let jp_user = User::builder("someone")
            .name("n")
            .custom("country", "jp")
            .build()
            .unwrap();
        assert!(eval.match_condition(&jp_user, &in_condition));
        assert!(!eval.match_condition(&user("someone-else"), &in_condition));
        // Unknown segment ids never match.
        let unknown = condition("", IS_IN_SEGMENT_CLAUSE, r#"["seg-404"]"#);
        assert!(!eval.match_condition(&user("seg-user-in"), &unknown));
    }

    #[test]
    fn test_legacy_segment_condition_uses_property_as_operator() {
        let eval = evaluator_with_segments(segment_fixture());
        let legacy = Condition {
            property: IS_IN_SEGMENT_CLAUSE.to_string(),
            op: None,
            value: Some(r#"["seg-1"]"#.to_string()),
        };
        assert!(eval.match_condition(&user("seg-user-in"), &legacy));
    }

    #[test]
    fn test_percentage_of_key_is_deterministic() {
        let p1 = percentage_of_key("ff-test-bool/u-1");
        let p2 = percentage_of_key("ff-test-bool/u-1");
        assert_eq!(p1, p2);
        assert!((0.0..=1.0).contains(&p1));
        // Known MD5 value: the empty key hashes to ~0.3005.
        let p = percentage_of_key("");
        assert!((0.3000..0.3010).contains(&p), "unexpected bucket {p}");
    }

    #[test]
    fn test_full_interval_always_matches() {
        assert!(key_in_rollout("anything", [0.0, 1.0]));
        assert!(!key_in_rollout("", [0.31, 0.32]));
        assert!(key_in_rollout("", [0.30, 0.31]));
    }

    #[test]
    fn test_rollout_partition_is_stable() {
        let mut flag = bool_flag();
        flag.fallthrough = RolloutDispatch {
            dispatch_key: None,
            included_in_expt: false,
            variations: vec![
                RolloutVariation {
                    id: "v-true".to_string(),
                    rollout: [0.0, 0.5],
                    expt_rollout: 0.0,
                },
                RolloutVariation {
                    id: "v-false".to_string(),
                    rollout: [0.5, 1.0],
                    expt_rollout: 0.0,
                },
            ],
        };
        let eval = evaluator();
        for n in 0..32 {
            let u = user(&format!("bucket-user-{n}"));
            let first = eval.evaluate(&flag, &u);
            let second = eval.evaluate(&flag, &u);
            assert_eq!(first.variation_id, second.variation_id);
            let expected_first = percentage_of_key(&format!("{}{}", flag.key, u.key())) < 0.5;
            assert_eq!(first.variation_id == "v-true", expected_first);
        }
    }

    #[test]
    fn test_expt_include_all_targets_forces_experiment() {
        let mut flag = bool_flag();
        flag.expt_include_all_targets = true;
        let result = evaluator().evaluate(&flag, &user("test-target-user"));
        assert_eq!(result.reason, REASON_TARGET_MATCH);
        assert!(result.send_to_experiment);
        let result = evaluator().evaluate(&flag, &user("test-fallthrough-user"));
        assert!(result.send_to_experiment);
    }

    #[test]
    fn test_experiment_rollout_zero_never_sends() {
        let mut flag = bool_flag();
        flag.fallthrough.included_in_expt = true;
        flag.fallthrough.variations[0].expt_rollout = 0.0;
        let result = evaluator().evaluate(&flag, &user("test-fallthrough-user"));
        assert!(!result.send_to_experiment);
    }

    #[test]
    fn test_experiment_full_ratio_always_sends() {
        let mut flag = bool_flag();
        flag.fallthrough.included_in_expt = true;
        flag.fallthrough.variations[0].expt_rollout = 1.0;
        let result = evaluator().evaluate(&flag, &user("test-fallthrough-user"));
        // ratio 1.0 over a [0,1] interval covers every bucket
        assert!(result.send_to_experiment);
    }

    #[test]
    fn test_flag_references_segment() {
        let mut flag = bool_flag();
        assert!(!flag_references_segment(&flag, "seg-1"));
        flag.rules.push(FlagRule {
            conditions: vec![condition("", IS_IN_SEGMENT_CLAUSE, r#"["seg-1", "seg-2"]"#)],
            dispatch: full_rollout("v-true"),
        });
        assert!(flag_references_segment(&flag, "seg-1"));
        assert!(flag_references_segment(&flag, "seg-2"));
        assert!(!flag_references_segment(&flag, "seg-3"));
    }
}
