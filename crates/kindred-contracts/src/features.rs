use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One per generated phone-app screen. Every feature runs the same
/// collect → prompt → call → recover → cache pipeline; only the spec differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    Notes,
    Mail,
    Maps,
    Wallet,
    Messages,
    Phone,
    ScreenTime,
    FictionComments,
    CouplesReport,
    MomentsComments,
}

/// Minimal structural contract a recovered payload must satisfy.
///
/// `min_items` is the cardinality the deterministic fallback provides; a
/// genuine model response is accepted as long as at least one item conforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedShape {
    ObjectList {
        min_items: usize,
        required_keys: &'static [&'static str],
    },
    Object {
        required_keys: &'static [&'static str],
    },
}

impl ExpectedShape {
    /// Opening/closing delimiter the raw text is scanned for.
    pub fn delimiters(&self) -> (char, char) {
        match self {
            ExpectedShape::ObjectList { .. } => ('[', ']'),
            ExpectedShape::Object { .. } => ('{', '}'),
        }
    }

    /// Validates a parsed value against the contract and normalizes it.
    /// Lists are filtered down to items carrying every required key; an
    /// object must carry all required keys at the top level.
    pub fn conform(&self, value: &Value) -> Option<Value> {
        match self {
            ExpectedShape::ObjectList { required_keys, .. } => {
                let items = value.as_array()?;
                let kept: Vec<Value> = items
                    .iter()
                    .filter(|item| {
                        required_keys.iter().all(|key| {
                            item.get(*key).map(|field| !field.is_null()).unwrap_or(false)
                        })
                    })
                    .cloned()
                    .collect();
                if kept.is_empty() {
                    return None;
                }
                Some(Value::Array(kept))
            }
            ExpectedShape::Object { required_keys } => {
                let map = value.as_object()?;
                if required_keys.iter().all(|key| map.contains_key(*key)) {
                    Some(value.clone())
                } else {
                    None
                }
            }
        }
    }
}

/// Static description of one feature's generation contract.
#[derive(Debug, Clone, Copy)]
pub struct FeatureSpec {
    pub key: &'static str,
    /// App title as shown on the phone screen.
    pub title: &'static str,
    /// Opening instruction, completed by the prompt builder.
    pub task: &'static str,
    pub shape: ExpectedShape,
    /// Numbered style/tone constraints embedded verbatim into the prompt.
    pub rules: &'static str,
    /// Concrete example output; the recovery parser relies on the model
    /// having seen the exact target schema.
    pub example: &'static str,
}

impl Feature {
    pub fn all() -> &'static [Feature] {
        &[
            Feature::Notes,
            Feature::Mail,
            Feature::Maps,
            Feature::Wallet,
            Feature::Messages,
            Feature::Phone,
            Feature::ScreenTime,
            Feature::FictionComments,
            Feature::CouplesReport,
            Feature::MomentsComments,
        ]
    }

    pub fn key(&self) -> &'static str {
        self.spec().key
    }

    pub fn title(&self) -> &'static str {
        self.spec().title
    }

    pub fn from_key(key: &str) -> Option<Feature> {
        Feature::all()
            .iter()
            .copied()
            .find(|feature| feature.key() == key)
    }

    pub fn spec(&self) -> FeatureSpec {
        match self {
            Feature::Notes => FeatureSpec {
                key: "notes",
                title: "备忘录",
                task: "请生成8条真实的备忘录，每条需包含标题和详细内容。",
                shape: ExpectedShape::ObjectList {
                    min_items: 8,
                    required_keys: &["title", "content"],
                },
                rules: "1. 内容可以与对话相关，也可以是角色的日常琐事\n2. 每条标题简短（8-20字），内容详细真实、有活人感\n3. 纯口语化表达，短句为主，多换行；模糊信息标注「大概/待确认」\n4. 重要事项可加提醒符号和一句真人式提醒（如“别忘带”）\n5. 必须生成8条，不能少",
                example: r#"[{"title":"标题1","content":"详细内容1"},{"title":"标题2","content":"详细内容2"}]"#,
            },
            Feature::Mail => FeatureSpec {
                key: "mail",
                title: "邮件",
                task: "请生成6封收件箱邮件，贴合角色当下的生活与工作。",
                shape: ExpectedShape::ObjectList {
                    min_items: 6,
                    required_keys: &["sender", "subject", "preview"],
                },
                rules: "1. 发件人要多样：同事、订阅、账单、朋友等\n2. 主题简短，预览为正文前一两句\n3. time 用 HH:MM 格式，unread 为布尔值\n4. 内容符合角色设定，不要出现AI痕迹",
                example: r#"[{"sender":"发件人","email":"someone@example.com","subject":"主题","preview":"预览内容","time":"09:30","unread":true}]"#,
            },
            Feature::Maps => FeatureSpec {
                key: "maps",
                title: "地图",
                task: "请生成今日的行程轨迹数据。",
                shape: ExpectedShape::Object {
                    required_keys: &["summary", "timeline"],
                },
                rules: "1. 生成8-12个真实的行程地点，早上从家出发，最后回家\n2. 每个地点包含名称、详细地址、到达时间（HH:MM）、停留时长（分钟）、类型（home/work/food/shopping/entertainment/transport/other）\n3. 行程要符合逻辑且丰富，符合角色人设\n4. summary 汇总总时长、总距离、地点数",
                example: r#"{"summary":{"totalTime":"8小时30分钟","totalDistance":"15.2公里","locations":6},"timeline":[{"time":"08:00","location":"家","address":"幸福小区3栋","duration":30,"type":"home"}]}"#,
            },
            Feature::Wallet => FeatureSpec {
                key: "wallet",
                title: "钱包",
                task: "请生成钱包页面数据，包括银行卡、近期交易和收支统计。",
                shape: ExpectedShape::Object {
                    required_keys: &["cards", "transactions", "stats"],
                },
                rules: "1. cards 为1-3张卡，含卡名、尾号、余额\n2. transactions 为8-12条近期交易，支出金额带负号\n3. 交易要贴合角色的生活习惯与消费水平\n4. stats 汇总今日支出、今日收入、本月支出",
                example: r#"{"cards":[{"name":"储蓄卡","tail":"6688","balance":"12580.50"}],"transactions":[{"title":"便利店","amount":"-18.50","time":"08:12","category":"food"}],"stats":{"todayExpense":"58.50","todayIncome":"0.00","monthExpense":"3200.00"}}"#,
            },
            Feature::Messages => FeatureSpec {
                key: "messages",
                title: "信息",
                task: "请生成5条手机短信会话预览。",
                shape: ExpectedShape::ObjectList {
                    min_items: 5,
                    required_keys: &["contact", "preview", "time"],
                },
                rules: "1. 联系人要多样：快递、验证码、朋友、家人等\n2. 预览为最后一条短信的前一两句\n3. time 用 HH:MM 或「昨天」等口语化表达\n4. 不要出现与对话矛盾的内容",
                example: r#"[{"contact":"快递驿站","preview":"您的包裹已到驿站，取件码8-1-2021","time":"10:05","unread":true}]"#,
            },
            Feature::Phone => FeatureSpec {
                key: "phone",
                title: "电话",
                task: "请生成6条最近通话记录。",
                shape: ExpectedShape::ObjectList {
                    min_items: 6,
                    required_keys: &["contact", "kind", "time"],
                },
                rules: "1. kind 取 incoming/outgoing/missed 之一\n2. duration 为通话时长（如“3分12秒”），未接听则为空字符串\n3. 联系人与角色的人际关系保持一致\n4. 时间从近到远排列",
                example: r#"[{"contact":"妈妈","kind":"incoming","time":"19:42","duration":"12分03秒"}]"#,
            },
            Feature::ScreenTime => FeatureSpec {
                key: "screen-time",
                title: "屏幕使用时间",
                task: "请生成今日的屏幕使用时间统计。",
                shape: ExpectedShape::Object {
                    required_keys: &["totalTime", "apps"],
                },
                rules: "1. totalTime 为 {hours, minutes}\n2. apps 为5-8个App的使用时长，按时长从高到低\n3. App 选择要符合角色人设（比如画手常用绘画类App）\n4. category 取 social/entertainment/productivity/game/other",
                example: r#"{"totalTime":{"hours":5,"minutes":30},"apps":[{"name":"微信","hours":1,"minutes":45,"category":"social"}]}"#,
            },
            Feature::FictionComments => FeatureSpec {
                key: "fiction-comments",
                title: "小说评论",
                task: "请以读者视角为这段同人小说生成8条评论。",
                shape: ExpectedShape::ObjectList {
                    min_items: 8,
                    required_keys: &["username", "content", "likes"],
                },
                rules: "1. username 为网络昵称，风格多样\n2. 评论口语化，有催更、玩梗、截图吐槽等真实读者行为\n3. likes 为50-999之间的整数\n4. 只返回有效的JSON数据，不要使用markdown代码块标记",
                example: r#"[{"username":"昵称","content":"评论内容","likes":128}]"#,
            },
            Feature::CouplesReport => FeatureSpec {
                key: "couples-report",
                title: "情侣空间",
                task: "请根据最近的对话生成一份两人关系分析报告。",
                shape: ExpectedShape::Object {
                    required_keys: &["summary", "highlights"],
                },
                rules: "1. summary 为一段温和客观的总评（100-200字）\n2. highlights 为3-5条最近的甜蜜瞬间，引用对话细节\n3. suggestions 为2-3条相处建议，语气轻松\n4. closeness 为0-100的亲密度数值",
                example: r#"{"closeness":86,"summary":"总评内容","highlights":["瞬间1","瞬间2"],"suggestions":["建议1"]}"#,
            },
            Feature::MomentsComments => FeatureSpec {
                key: "moments-comments",
                title: "朋友圈评论",
                task: "请为这条朋友圈动态生成角色们的评论。",
                shape: ExpectedShape::ObjectList {
                    min_items: 3,
                    required_keys: &["name", "content"],
                },
                rules: "1. 每条评论以评论者的口吻，符合各自人设\n2. 评论简短自然（10-40字），可互相搭话\n3. 不要重复相同的句式\n4. 只返回JSON数组，不要任何其他内容",
                example: r#"[{"name":"评论者","content":"评论内容"}]"#,
            },
        }
    }

    /// Deterministic placeholder payload substituted when recovery parsing
    /// exhausts every strategy. Always satisfies `spec().shape`.
    pub fn fallback_default(&self) -> Value {
        match self {
            Feature::Notes => Value::Array(
                (1..=8)
                    .map(|idx| {
                        json!({
                            "title": format!("备忘录 {idx}"),
                            "content": format!("这是第{idx}条备忘录的默认内容。"),
                        })
                    })
                    .collect(),
            ),
            Feature::Mail => Value::Array(
                (1..=6)
                    .map(|idx| {
                        json!({
                            "sender": "系统通知",
                            "email": "noreply@example.com",
                            "subject": format!("邮件 {idx}"),
                            "preview": "暂无内容。",
                            "time": "09:00",
                            "unread": false,
                        })
                    })
                    .collect(),
            ),
            Feature::Maps => json!({
                "summary": {"totalTime": "0小时", "totalDistance": "0公里", "locations": 1},
                "timeline": [
                    {"time": "08:00", "location": "家", "address": "暂无地址", "duration": 0, "type": "home"}
                ],
            }),
            Feature::Wallet => json!({
                "cards": [{"name": "储蓄卡", "tail": "0000", "balance": "0.00"}],
                "transactions": [{"title": "暂无交易", "amount": "0.00", "time": "00:00", "category": "other"}],
                "stats": {"todayExpense": "0.00", "todayIncome": "0.00", "monthExpense": "0.00"},
            }),
            Feature::Messages => Value::Array(
                (1..=5)
                    .map(|idx| {
                        json!({
                            "contact": format!("联系人 {idx}"),
                            "preview": "暂无短信内容。",
                            "time": "00:00",
                            "unread": false,
                        })
                    })
                    .collect(),
            ),
            Feature::Phone => Value::Array(
                (1..=6)
                    .map(|idx| {
                        json!({
                            "contact": format!("联系人 {idx}"),
                            "kind": "incoming",
                            "time": "00:00",
                            "duration": "",
                        })
                    })
                    .collect(),
            ),
            Feature::ScreenTime => json!({
                "totalTime": {"hours": 0, "minutes": 0},
                "apps": [{"name": "微信", "hours": 0, "minutes": 0, "category": "social"}],
            }),
            Feature::FictionComments => Value::Array(
                (1..=8)
                    .map(|idx| {
                        json!({
                            "username": format!("读者{idx}"),
                            "content": "催更！",
                            "likes": 50,
                        })
                    })
                    .collect(),
            ),
            Feature::CouplesReport => json!({
                "closeness": 50,
                "summary": "暂时没有足够的对话来生成报告。",
                "highlights": ["多聊聊天，这里就会出现你们的瞬间。"],
                "suggestions": ["今天也记得说晚安。"],
            }),
            Feature::MomentsComments => Value::Array(
                (1..=3)
                    .map(|idx| {
                        json!({
                            "name": format!("好友{idx}"),
                            "content": "赞！",
                        })
                    })
                    .collect(),
            ),
        }
    }
}

/// Ordered lookup of every feature, keyed by its cache/CLI key.
#[derive(Debug, Clone)]
pub struct FeatureRegistry {
    features: IndexMap<&'static str, Feature>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        let mut features = IndexMap::new();
        for feature in Feature::all() {
            features.insert(feature.key(), *feature);
        }
        Self { features }
    }

    pub fn get(&self, key: &str) -> Option<Feature> {
        self.features.get(key).copied()
    }

    pub fn list(&self) -> impl Iterator<Item = Feature> + '_ {
        self.features.values().copied()
    }
}

impl Default for FeatureRegistry {
    fn default() -> Self {
        Self::new()
    }
}
